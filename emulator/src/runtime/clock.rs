//! The real-time clock thread.
//!
//! Every tick pulses each configured counter. A counter whose MTB/MTH/MTW has
//! already been executed once at its vector is updated in memory directly;
//! any other pulse goes through the interrupt controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, select, tick, Sender};
use tracing::{debug, trace, warn};

use super::{CounterCell, Inhibit, Interrupts, LevelState, RealMemory};
use crate::config::MachineConfig;
use crate::constants::{self as C, Address};

pub(crate) struct Clock {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Clock {
    /// Start ticking. Pulses are only generated while `running` is set.
    pub(crate) fn spawn(
        config: &MachineConfig,
        memory: Arc<RealMemory>,
        interrupts: Arc<Interrupts>,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let (stop, stopped) = bounded(1);
        let counters = config.counters;
        let ticks = tick(config.clock_tick);

        let handle = std::thread::Builder::new()
            .name("sigma-clock".into())
            .spawn(move || {
                debug!("Clock started");
                loop {
                    select! {
                        recv(stopped) -> _ => break,
                        recv(ticks) -> _ => {
                            if running.load(Ordering::Acquire) {
                                pulse(&counters, &memory, &interrupts);
                            }
                        }
                    }
                }
                debug!("Clock stopped");
            })?;

        Ok(Self { stop, handle })
    }

    pub(crate) fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("Clock thread panicked");
        }
    }
}

/// Whether the instruction at the counter's vector is still the one registered
fn still_installed(memory: &RealMemory, level: u8, cell: &CounterCell) -> bool {
    let vector = C::INTERRUPT_BASE + Address::from(level);
    memory
        .load_word(vector * C::WORD_BYTES)
        .is_ok_and(|word| word == cell.instruction)
}

/// One clock tick
pub(crate) fn pulse(counters: &[bool; C::COUNTERS], memory: &RealMemory, interrupts: &Interrupts) {
    let inhibited = interrupts.published_inhibit().contains(Inhibit::COUNTER);

    for counter in (0..C::COUNTERS).filter(|&counter| counters[counter]) {
        let level = C::LEVEL_COUNTER_PULSE + counter as u8;
        let state = interrupts.level(level);
        if state.state == LevelState::Disarmed || !state.enabled {
            continue;
        }

        let cell = interrupts
            .counter(counter)
            .filter(|cell| !inhibited && still_installed(memory, level, cell));
        let Some(cell) = cell else {
            interrupts.trigger(level);
            continue;
        };

        let modified = match cell.size {
            1 => memory.modify_byte(cell.address, cell.delta, 0),
            2 => memory.modify_half(cell.address, cell.delta, 0),
            _ => memory.modify_word(cell.address, cell.delta, 0),
        };
        match modified {
            Ok(modified) if modified.result == 0 => {
                trace!(counter, "Counter reached zero");
                interrupts.trigger(C::LEVEL_COUNTER_ZERO + counter as u8);
            }
            Ok(_) => {}
            Err(error) => {
                warn!(counter, %error, "Dropping counter cell");
                interrupts.unregister_counter(counter);
                interrupts.trigger(level);
            }
        }
    }
}
