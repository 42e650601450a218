//! The 32-level priority interrupt controller.
//!
//! Each level is disarmed, armed, waiting or active. Posting an event makes
//! an armed level wait; the processor polls [`Interrupts::new_active`] once
//! per instruction, which promotes the highest-priority waiting level to
//! active if it is enabled, not inhibited by the PSD and of higher priority
//! (lower number) than every active level. The level stays active until
//! cleared by LPSD.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use parse_display::Display;
use tracing::{debug, trace};

use super::registers::Inhibit;
use crate::constants::{self as C, Address, Word};
use crate::sync::Signal;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[display(style = "lowercase")]
pub enum LevelState {
    #[default]
    Disarmed,
    Armed,
    Waiting,
    Active,
}

/// Observable state of one level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptLevel {
    pub state: LevelState,
    pub enabled: bool,

    /// Events accepted on this level since reset
    pub count: u64,
}

/// A terminal line event attached to an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEvent {
    pub line: u16,
    pub character: u8,
}

/// One posted interrupt event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptData {
    pub timestamp: Instant,
    pub level: u8,

    /// Order within a level, lower first
    pub priority: u8,

    pub device_address: u16,

    /// Opaque identifier of the posting device
    pub device_handle: usize,

    pub line: Option<LineEvent>,
}

impl InterruptData {
    #[must_use]
    pub fn new(level: u8) -> Self {
        Self {
            timestamp: Instant::now(),
            level,
            priority: 0,
            device_address: 0,
            device_handle: 0,
            line: None,
        }
    }

    #[must_use]
    pub fn with_device(mut self, device_address: u16, device_handle: usize) -> Self {
        self.device_address = device_address;
        self.device_handle = device_handle;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_line(mut self, line: LineEvent) -> Self {
        self.line = Some(line);
        self
    }
}

/// The PSD inhibit bit that masks a level, if any
#[must_use]
pub fn inhibit_class(level: u8) -> Inhibit {
    match level {
        2..=5 | 8..=11 => Inhibit::COUNTER,
        C::LEVEL_IO | C::LEVEL_PANEL => Inhibit::IO,
        16..=31 => Inhibit::EXTERNAL,
        _ => Inhibit::empty(),
    }
}

/// Whether every post to a level is kept, instead of folding into one pending event
#[must_use]
pub fn always_queues(level: u8) -> bool {
    level == C::LEVEL_IO || level >= C::LEVEL_EXTERNAL
}

/// The word a clock pulse applies to, found by executing the MTB/MTH/MTW at a
/// counter-pulse vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterCell {
    /// The instruction word at the vector when it was registered
    pub instruction: Word,

    /// Real byte address of the counter
    pub address: Address,

    /// Operand size in bytes
    pub size: u8,

    pub delta: i32,
}

#[derive(Debug, Default, Clone, Copy)]
struct Level {
    armed: bool,
    enabled: bool,
    active: bool,
    count: u64,
}

/// State guarded by the controller lock
#[derive(Debug, Default)]
struct Controller {
    levels: [Level; C::INTERRUPT_LEVELS],
    queue: BTreeMap<(u8, u8, u64), InterruptData>,
    serviced: [Option<InterruptData>; C::INTERRUPT_LEVELS],
    sequence: u64,
}

impl Controller {
    fn is_waiting(&self, level: u8) -> bool {
        self.queue
            .range((level, 0, 0)..=(level, u8::MAX, u64::MAX))
            .next()
            .is_some()
    }

    fn drop_waiting(&mut self, level: u8) {
        self.queue.retain(|&(l, _, _), _| l != level);
    }

    fn highest_active(&self) -> Option<u8> {
        self.levels
            .iter()
            .position(|level| level.active)
            .map(|level| level as u8)
    }

    /// The first waiting level eligible for promotion
    fn eligible(&self, inhibit: Inhibit) -> Option<(u8, u8, u64)> {
        let ceiling = self.highest_active().unwrap_or(C::INTERRUPT_LEVELS as u8);
        self.queue.keys().copied().find(|&(level, _, _)| {
            let state = self.levels[usize::from(level)];
            level < ceiling && state.enabled && !inhibit.intersects(inhibit_class(level))
        })
    }

    fn state(&self, level: u8) -> LevelState {
        let entry = self.levels[usize::from(level)];
        if entry.active {
            LevelState::Active
        } else if self.is_waiting(level) {
            LevelState::Waiting
        } else if entry.armed {
            LevelState::Armed
        } else {
            LevelState::Disarmed
        }
    }
}

/// The interrupt subsystem shared between the processor, the clock thread and devices
#[derive(Debug)]
pub struct Interrupts {
    controller: Mutex<Controller>,
    counters: Mutex<[Option<CounterCell>; C::COUNTERS]>,
    inhibit: AtomicU8,
    wake: Signal,
}

impl Default for Interrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupts {
    #[must_use]
    pub fn new() -> Self {
        Self {
            controller: Mutex::new(Controller::default()),
            counters: Mutex::new([None; C::COUNTERS]),
            inhibit: AtomicU8::new(0),
            wake: Signal::new(),
        }
    }

    fn controller(&self) -> MutexGuard<'_, Controller> {
        self.controller.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signalled whenever an event is accepted, to wake a waiting processor
    #[must_use]
    pub fn wake_signal(&self) -> &Signal {
        &self.wake
    }

    /// Arm a level, discarding anything waiting or active on it
    pub fn arm(&self, level: u8) {
        let mut controller = self.controller();
        let index = usize::from(level) % C::INTERRUPT_LEVELS;
        controller.drop_waiting(index as u8);
        controller.levels[index].armed = true;
        controller.levels[index].active = false;
        controller.serviced[index] = None;
    }

    /// Disarm a level, discarding anything waiting or active on it
    pub fn disarm(&self, level: u8) {
        let mut controller = self.controller();
        let index = usize::from(level) % C::INTERRUPT_LEVELS;
        controller.drop_waiting(index as u8);
        controller.levels[index].armed = false;
        controller.levels[index].active = false;
        controller.serviced[index] = None;
    }

    pub fn enable(&self, level: u8) {
        self.set_enabled(level, true);
    }

    pub fn disable(&self, level: u8) {
        self.set_enabled(level, false);
    }

    fn set_enabled(&self, level: u8, enabled: bool) {
        let mut controller = self.controller();
        controller.levels[usize::from(level) % C::INTERRUPT_LEVELS].enabled = enabled;
        drop(controller);
        if enabled {
            self.wake.notify();
        }
    }

    /// Set the enable bit of all sixteen levels of a group from a mask, bit
    /// `n` for level `16 * group + n`
    pub fn set_enable_mask(&self, group: u8, mask: u16) {
        let mut controller = self.controller();
        for n in 0..16 {
            let level = usize::from(group % 2) * 16 + n;
            controller.levels[level].enabled = mask & (1 << n) != 0;
        }
        drop(controller);
        self.wake.notify();
    }

    /// Post an event. Returns false if it was dropped, either because the
    /// level is disarmed or because a coalescing level already has one
    /// pending.
    #[tracing::instrument(skip(self, data), fields(level = data.level))]
    pub fn post(&self, data: InterruptData) -> bool {
        let level = data.level % C::INTERRUPT_LEVELS as u8;
        let mut controller = self.controller();
        let entry = controller.levels[usize::from(level)];

        if !entry.armed {
            trace!("Dropping interrupt on disarmed level");
            return false;
        }

        if !always_queues(level) && (entry.active || controller.is_waiting(level)) {
            trace!("Coalescing interrupt into the pending one");
            return false;
        }

        controller.sequence += 1;
        let key = (level, data.priority, controller.sequence);
        controller.queue.insert(key, InterruptData { level, ..data });
        controller.levels[usize::from(level)].count += 1;
        drop(controller);

        self.wake.notify();
        true
    }

    /// Post a bare event on a level
    pub fn trigger(&self, level: u8) -> bool {
        self.post(InterruptData::new(level))
    }

    /// Promote the highest-priority eligible waiting level to active
    pub fn new_active(&self, inhibit: Inhibit) -> Option<InterruptData> {
        let mut controller = self.controller();
        let key = controller.eligible(inhibit)?;
        let data = controller.queue.remove(&key)?;
        let level = usize::from(data.level);
        controller.levels[level].active = true;
        controller.serviced[level] = Some(data.clone());
        debug!(level = data.level, "Interrupt level active");
        Some(data)
    }

    /// Whether [`Interrupts::new_active`] would return an event
    #[must_use]
    pub fn has_eligible(&self, inhibit: Inhibit) -> bool {
        self.controller().eligible(inhibit).is_some()
    }

    /// Clear the highest-priority active level, then re-arm or disarm it.
    /// Returns the level cleared.
    pub fn clear_highest_active(&self, rearm: bool) -> Option<u8> {
        let mut controller = self.controller();
        let level = controller.highest_active()?;
        let index = usize::from(level);
        controller.levels[index].active = false;
        controller.levels[index].armed = rearm;
        controller.serviced[index] = None;
        if !rearm {
            controller.drop_waiting(level);
        }
        drop(controller);

        // Lower-priority levels may have been held off by this one
        self.wake.notify();
        Some(level)
    }

    /// Clear an active level, leaving it armed
    pub fn clear(&self, level: u8) {
        let mut controller = self.controller();
        let index = usize::from(level) % C::INTERRUPT_LEVELS;
        controller.levels[index].active = false;
        controller.serviced[index] = None;
        drop(controller);
        self.wake.notify();
    }

    /// Consume the event being serviced on a level, or else its oldest waiting one
    pub fn acknowledge(&self, level: u8) -> Option<InterruptData> {
        let mut controller = self.controller();
        let index = usize::from(level) % C::INTERRUPT_LEVELS;
        if let Some(data) = controller.serviced[index].take() {
            return Some(data);
        }

        let key = controller
            .queue
            .range((level, 0, 0)..=(level, u8::MAX, u64::MAX))
            .next()
            .map(|(key, _)| *key)?;
        controller.queue.remove(&key)
    }

    #[must_use]
    pub fn highest_active(&self) -> Option<u8> {
        self.controller().highest_active()
    }

    #[must_use]
    pub fn level(&self, level: u8) -> InterruptLevel {
        let controller = self.controller();
        let index = usize::from(level) % C::INTERRUPT_LEVELS;
        InterruptLevel {
            state: controller.state(index as u8),
            enabled: controller.levels[index].enabled,
            count: controller.levels[index].count,
        }
    }

    /// State of every level
    #[must_use]
    pub fn snapshot(&self) -> [InterruptLevel; C::INTERRUPT_LEVELS] {
        let controller = self.controller();
        std::array::from_fn(|index| InterruptLevel {
            state: controller.state(index as u8),
            enabled: controller.levels[index].enabled,
            count: controller.levels[index].count,
        })
    }

    /// Publish the current PSD inhibits for threads outside the processor
    pub fn publish_inhibit(&self, inhibit: Inhibit) {
        self.inhibit.store(inhibit.bits(), Ordering::Release);
    }

    #[must_use]
    pub fn published_inhibit(&self) -> Inhibit {
        Inhibit::from_bits_truncate(self.inhibit.load(Ordering::Acquire))
    }

    pub fn register_counter(&self, counter: usize, cell: CounterCell) {
        if let Some(slot) = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(counter)
        {
            *slot = Some(cell);
        }
    }

    pub fn unregister_counter(&self, counter: usize) {
        if let Some(slot) = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(counter)
        {
            *slot = None;
        }
    }

    #[must_use]
    pub fn counter(&self, counter: usize) -> Option<CounterCell> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(counter)
            .copied()
            .flatten()
    }

    /// Return every level to disarmed and disabled, dropping all events
    pub fn reset(&self) {
        *self.controller() = Controller::default();
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner) = [None; C::COUNTERS];
        self.inhibit.store(0, Ordering::Release);
        self.wake.try_take();
    }
}
