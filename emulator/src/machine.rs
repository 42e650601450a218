//! A powered-on machine.
//!
//! The processor runs on its own thread, executing batches of instructions
//! while holding the control lock on the [`Computer`]. The clock runs on a
//! second thread. Everything else (the monitor, devices, tooling) talks to the
//! machine through this handle, acquiring the control lock with a bounded
//! wait where a stale answer is better than blocking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::Instruction;
use crate::config::MachineConfig;
use crate::constants::{self as C, Address, Doubleword, Word};
use crate::runtime::clock::Clock;
use crate::runtime::{
    AddressBreakpoint, Computer, HaltReason, InterruptData, InterruptLevel, Interrupts,
    IoProcessor, MemoryError, OpcodeBreakpoint, Psd, RealMemory, Step, StepMode, Width,
};
use crate::sync::{ControlLock, Signal};

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("the processor did not release the control lock within {0:?}")]
    Busy(Duration),

    #[error("could not start the {0} thread")]
    Spawn(&'static str, #[source] std::io::Error),

    #[error("all address breakpoints are in use")]
    NoFreeBreakpoint,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PowerOffError {
    /// Nothing was changed; the machine is still running
    #[error("the processor did not release the control lock within {0:?}")]
    Timeout(Duration),
}

/// Reported on the halt channel whenever the processor stops running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltEvent {
    /// Stopped by a breakpoint, a completed step or a fatal fault
    Halted { reason: HaltReason, psd: Psd },

    /// Stopped on request
    Stopped { psd: Psd },

    /// The processor thread exited at power off
    Exited,
}

/// A point-in-time view of the processor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub psd: Psd,
    pub registers: [Word; C::REGISTERS],
    pub last_instruction: Option<(Address, Instruction)>,
    pub instructions: u64,
    pub traps: u64,
    pub interrupts: u64,
    pub waits: u64,
    pub wait_time: Duration,
    pub waiting: bool,
    pub running: bool,

    /// The latched fatal fault, if any
    pub fault: Option<String>,

    /// Why the processor last halted
    pub halt: Option<HaltReason>,

    /// The control lock was not obtained in time; this is an older snapshot
    pub stale: bool,
}

impl Status {
    fn capture(computer: &Computer, running: bool, halt: Option<HaltReason>) -> Self {
        let statistics = computer.statistics();
        Self {
            psd: computer.psd,
            registers: *computer.block(),
            last_instruction: computer.last_instruction(),
            instructions: statistics.instructions,
            traps: statistics.traps,
            interrupts: statistics.interrupts,
            waits: statistics.waits,
            wait_time: statistics.wait_time,
            waiting: computer.is_waiting(),
            running,
            fault: computer.fault().map(ToString::to_string),
            halt,
            stale: false,
        }
    }
}

/// State shared with the processor thread
struct Shared {
    computer: ControlLock<Computer>,
    interrupts: Arc<Interrupts>,
    config: MachineConfig,
    running: Arc<AtomicBool>,
    powered: AtomicBool,
    resume: Signal,
    halt: Mutex<Option<HaltReason>>,
    snapshot: Mutex<Status>,
    events: Sender<HaltEvent>,
}

impl Shared {
    fn halt(&self) -> MutexGuard<'_, Option<HaltReason>> {
        self.halt.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> MutexGuard<'_, Status> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn processor_loop(shared: &Shared) {
    info!("Processor thread started");
    let mut was_running = false;

    while shared.powered.load(Ordering::Acquire) {
        if !shared.running.load(Ordering::Acquire) {
            if was_running {
                was_running = false;
                let psd = shared.computer.lock().psd;
                debug!(%psd, "Processor stopped");
                let _ = shared.events.send(HaltEvent::Stopped { psd });
            }
            shared.resume.wait_timeout(shared.config.wait_poll);
            continue;
        }
        was_running = true;

        let (step, psd) = {
            let mut computer = shared.computer.lock();
            let step = computer.run(shared.config.batch_size);
            (step, computer.psd)
        };

        match step {
            Step::Continue => {}
            Step::Waiting => {
                let started = Instant::now();
                shared.interrupts.wake_signal().wait_timeout(shared.config.wait_poll);
                shared.computer.lock().record_wait(started.elapsed());
            }
            Step::Idle => {
                shared.interrupts.wake_signal().wait_timeout(shared.config.wait_poll);
            }
            Step::Halted(reason) => {
                shared.running.store(false, Ordering::Release);
                was_running = false;
                info!(%reason, ia = psd.ia, "Processor halted");
                *shared.halt() = Some(reason.clone());
                let _ = shared.events.send(HaltEvent::Halted { reason, psd });
            }
        }
    }

    let _ = shared.events.send(HaltEvent::Exited);
    info!("Processor thread exited");
}

pub struct Machine {
    shared: Arc<Shared>,
    memory: Arc<RealMemory>,
    cpu: Option<JoinHandle<()>>,
    clock: Option<Clock>,
    events: Receiver<HaltEvent>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("pages", &self.memory.pages())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Machine {
    /// Build the machine and start its processor and clock threads. The
    /// processor starts stopped.
    ///
    /// # Errors
    ///
    /// Fails if a thread cannot be spawned.
    #[tracing::instrument(skip(io))]
    pub fn power_on(config: MachineConfig, io: Box<dyn IoProcessor>) -> Result<Self, MachineError> {
        let memory = Arc::new(RealMemory::new(config.memory_pages));
        let interrupts = Arc::new(Interrupts::new());
        let computer = Computer::new(&config, Arc::clone(&memory), Arc::clone(&interrupts), io);
        let running = Arc::new(AtomicBool::new(false));
        let (sender, events) = unbounded();

        let clock = Clock::spawn(
            &config,
            Arc::clone(&memory),
            Arc::clone(&interrupts),
            Arc::clone(&running),
        )
        .map_err(|error| MachineError::Spawn("clock", error))?;

        let shared = Arc::new(Shared {
            computer: ControlLock::new(computer),
            interrupts,
            config,
            running,
            powered: AtomicBool::new(true),
            resume: Signal::new(),
            halt: Mutex::new(None),
            snapshot: Mutex::new(Status::default()),
            events: sender,
        });

        let cpu = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("sigma-cpu".into())
                .spawn(move || processor_loop(&shared))
        };
        let cpu = match cpu {
            Ok(cpu) => cpu,
            Err(error) => {
                clock.stop();
                return Err(MachineError::Spawn("processor", error));
            }
        };

        info!(pages = memory.pages(), "Machine powered on");
        Ok(Self {
            shared,
            memory,
            cpu: Some(cpu),
            clock: Some(clock),
            events,
        })
    }

    #[must_use]
    pub fn config(&self) -> &MachineConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<RealMemory> {
        &self.memory
    }

    #[must_use]
    pub fn interrupts(&self) -> &Arc<Interrupts> {
        &self.shared.interrupts
    }

    /// Receiver of the events sent whenever the processor stops
    #[must_use]
    pub fn halt_events(&self) -> &Receiver<HaltEvent> {
        &self.events
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Run `f` on the processor state, waiting at most the status timeout for
    /// the control lock
    ///
    /// # Errors
    ///
    /// Fails if the processor holds the lock past the timeout.
    pub fn with_computer<R>(&self, f: impl FnOnce(&mut Computer) -> R) -> Result<R, MachineError> {
        let timeout = self.shared.config.status_timeout;
        let mut computer = self
            .shared
            .computer
            .try_lock_for(timeout)
            .ok_or(MachineError::Busy(timeout))?;
        Ok(f(&mut computer))
    }

    /// A status snapshot, or the last one marked stale if the processor
    /// holds the control lock past the status timeout
    #[must_use]
    pub fn status(&self) -> Status {
        let running = self.is_running();
        match self.shared.computer.try_lock_for(self.shared.config.status_timeout) {
            Some(computer) => {
                let status = Status::capture(&computer, running, self.shared.halt().clone());
                *self.shared.snapshot() = status.clone();
                status
            }
            None => {
                warn!("Status snapshot timed out, returning a stale one");
                let mut status = self.shared.snapshot().clone();
                status.running = running;
                status.stale = true;
                status
            }
        }
    }

    /// Let the processor run
    pub fn start(&self) {
        *self.shared.halt() = None;
        self.shared.running.store(true, Ordering::Release);
        self.shared.resume.notify();
        debug!("Processor started");
    }

    /// Ask the processor to stop after its current batch
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.interrupts.wake_signal().notify();
    }

    fn start_in(&self, mode: StepMode) -> Result<(), MachineError> {
        self.with_computer(|computer| computer.set_step_mode(mode))?;
        self.start();
        Ok(())
    }

    /// Run `count` instructions, then halt
    ///
    /// # Errors
    ///
    /// Fails if the control lock cannot be acquired.
    pub fn step(&self, count: u64) -> Result<(), MachineError> {
        self.start_in(StepMode::Count(count.max(1)))
    }

    /// Run until a branch instruction transfers control (`taken`) or falls through
    ///
    /// # Errors
    ///
    /// Fails if the control lock cannot be acquired.
    pub fn step_until_branch(&self, taken: bool) -> Result<(), MachineError> {
        self.start_in(if taken {
            StepMode::BranchTaken
        } else {
            StepMode::BranchNotTaken
        })
    }

    /// Wait for the processor to stop, up to `timeout`
    #[must_use]
    pub fn wait_for_halt(&self, timeout: Duration) -> Option<HaltEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Reset the processor, map and interrupt controller; memory is kept
    ///
    /// # Errors
    ///
    /// Fails if the control lock cannot be acquired.
    pub fn reset(&self) -> Result<(), MachineError> {
        self.stop();
        self.with_computer(Computer::reset)?;
        *self.shared.halt() = None;
        Ok(())
    }

    /// Install the bootstrap for the configured boot device
    ///
    /// # Errors
    ///
    /// Fails if the control lock cannot be acquired or the bootstrap area is
    /// not installed.
    pub fn boot(&self) -> Result<(), MachineError> {
        let device = self.shared.config.boot_device;
        self.stop();
        self.with_computer(|computer| computer.boot(device))??;
        *self.shared.halt() = None;
        Ok(())
    }

    /// Set the instruction address
    ///
    /// # Errors
    ///
    /// Fails if the control lock cannot be acquired.
    pub fn set_ia(&self, ia: Address) -> Result<(), MachineError> {
        self.with_computer(|computer| computer.psd.ia = ia & C::ADDRESS_MASK)
    }

    /// Read memory for tooling, through the map when `mapped`
    ///
    /// # Errors
    ///
    /// Fails if the control lock cannot be acquired or the address does not exist.
    pub fn peek(
        &self,
        width: Width,
        address: Address,
        mapped: bool,
    ) -> Result<Doubleword, MachineError> {
        Ok(self.with_computer(|computer| computer.peek(width, address, mapped))??)
    }

    /// Write memory for tooling, ignoring write locks
    ///
    /// # Errors
    ///
    /// Fails if the control lock cannot be acquired or the address does not exist.
    pub fn poke(
        &self,
        width: Width,
        address: Address,
        value: Doubleword,
        mapped: bool,
    ) -> Result<(), MachineError> {
        Ok(self.with_computer(|computer| computer.poke(width, address, value, mapped))??)
    }

    /// Place an address breakpoint in a free slot, returning the slot
    ///
    /// # Errors
    ///
    /// Fails if the control lock cannot be acquired or every slot is taken.
    pub fn add_breakpoint(&self, breakpoint: AddressBreakpoint) -> Result<usize, MachineError> {
        self.with_computer(|computer| computer.breakpoints.add(breakpoint))?
            .ok_or(MachineError::NoFreeBreakpoint)
    }

    /// # Errors
    ///
    /// Fails if the control lock cannot be acquired.
    pub fn remove_breakpoint(
        &self,
        slot: usize,
    ) -> Result<Option<AddressBreakpoint>, MachineError> {
        self.with_computer(|computer| computer.breakpoints.remove(slot))
    }

    /// # Errors
    ///
    /// Fails if the control lock cannot be acquired.
    pub fn set_opcode_breakpoint(
        &self,
        breakpoint: Option<OpcodeBreakpoint>,
    ) -> Result<(), MachineError> {
        self.with_computer(|computer| computer.breakpoints.opcode = breakpoint)
    }

    /// Halt when a trap or interrupt exchanges through `vector`
    ///
    /// # Errors
    ///
    /// Fails if the control lock cannot be acquired.
    pub fn set_trap_breakpoint(&self, vector: Option<Address>) -> Result<(), MachineError> {
        self.with_computer(|computer| computer.breakpoints.trap = vector)
    }

    /// Post an interrupt event. Returns false if it was dropped.
    pub fn post(&self, data: InterruptData) -> bool {
        self.shared.interrupts.post(data)
    }

    /// Post a bare event on a level
    pub fn trigger(&self, level: u8) -> bool {
        self.shared.interrupts.trigger(level)
    }

    #[must_use]
    pub fn interrupt_levels(&self) -> [InterruptLevel; C::INTERRUPT_LEVELS] {
        self.shared.interrupts.snapshot()
    }

    /// Stop both threads and release the processor. All or nothing: if the
    /// processor does not release the control lock in time, nothing changes.
    /// Powering off twice does nothing.
    ///
    /// # Errors
    ///
    /// Fails if the control lock cannot be acquired within the power-off timeout.
    #[tracing::instrument(skip(self))]
    pub fn power_off(&mut self) -> Result<(), PowerOffError> {
        if self.cpu.is_none() {
            return Ok(());
        }

        let timeout = self.shared.config.power_off_timeout;
        {
            let Some(_computer) = self.shared.computer.try_lock_for(timeout) else {
                warn!(?timeout, "Power off timed out");
                return Err(PowerOffError::Timeout(timeout));
            };
            self.shared.running.store(false, Ordering::Release);
            self.shared.powered.store(false, Ordering::Release);
        }

        self.join();

        let empty = Arc::new(RealMemory::empty());
        self.shared.computer.lock().release(Arc::clone(&empty));
        self.memory = empty;
        info!("Machine powered off");
        Ok(())
    }

    /// Wake every waiting thread and join them
    fn join(&mut self) {
        self.shared.resume.notify();
        self.shared.interrupts.wake_signal().notify();
        if let Some(clock) = self.clock.take() {
            clock.stop();
        }
        if let Some(cpu) = self.cpu.take() {
            if cpu.join().is_err() {
                warn!("Processor thread panicked");
            }
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.powered.store(false, Ordering::Release);
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::codec::parse;
    use crate::runtime::{BreakHit, BreakSource, NullIo};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn machine_with(listing: &str) -> Machine {
        let config = MachineConfig::default().with_memory_pages(4);
        let machine = Machine::power_on(config, Box::new(NullIo)).unwrap();
        let words: Vec<Word> = listing
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| parse(line).map(Word::from).unwrap())
            .collect();
        machine
            .with_computer(|computer| {
                computer.load_words(0x100, &words).unwrap();
                computer.psd.ia = 0x100;
            })
            .unwrap();
        machine
    }

    const COUNTING: &str = indoc! {"
        LI,1    0
        AI,1    1
        BCR,0   X'101'
    "};

    #[test]
    fn breakpoint_test() {
        let machine = machine_with(COUNTING);
        assert_eq!(machine.add_breakpoint(AddressBreakpoint::at(0x102)).unwrap(), 0);

        machine.start();
        let event = machine.wait_for_halt(TIMEOUT).unwrap();
        let hit = BreakHit {
            source: BreakSource::Address(0),
            address: 0x102,
        };
        let HaltEvent::Halted { reason, psd } = event.clone() else {
            panic!("unexpected event {event:?}");
        };
        assert_eq!(reason, HaltReason::Breakpoint(hit));
        assert_eq!(psd.ia, 0x102);

        let status = machine.status();
        assert!(!status.running);
        assert!(!status.stale);
        assert_eq!(status.registers[1], 1);
        assert_eq!(status.halt, Some(HaltReason::Breakpoint(hit)));

        // Resuming runs the instruction under the breakpoint
        machine.start();
        machine.wait_for_halt(TIMEOUT).unwrap();
        assert_eq!(machine.status().registers[1], 2);
    }

    #[test]
    fn step_test() {
        let machine = machine_with(COUNTING);

        machine.step(5).unwrap();
        assert!(matches!(
            machine.wait_for_halt(TIMEOUT),
            Some(HaltEvent::Halted {
                reason: HaltReason::StepComplete,
                ..
            })
        ));
        let status = machine.status();
        assert_eq!(status.instructions, 5);
        assert_eq!(status.registers[1], 2);
        assert_eq!(status.last_instruction.map(|(ia, _)| ia), Some(0x102));

        machine.step_until_branch(true).unwrap();
        assert!(machine.wait_for_halt(TIMEOUT).is_some());
        assert_eq!(machine.status().psd.ia, 0x101);
    }

    #[test]
    fn wait_and_stop_test() {
        let machine = machine_with("WAIT 0");

        machine.start();
        let deadline = Instant::now() + TIMEOUT;
        while !machine.status().waiting {
            assert!(Instant::now() < deadline, "processor never waited");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(machine.status().waits, 1);

        machine.stop();
        assert!(matches!(
            machine.wait_for_halt(TIMEOUT),
            Some(HaltEvent::Stopped { psd }) if psd.ia == 0x101
        ));
    }

    #[test]
    fn countdown_speed_test() {
        let machine = machine_with(indoc! {"
            LI,1    500
            BDR,1   X'101'
            WAIT    0
        "});

        let started = Instant::now();
        machine.start();
        while !machine.status().waiting {
            assert!(started.elapsed() < Duration::from_secs(2), "countdown stalled");
            std::thread::sleep(Duration::from_millis(1));
        }

        let status = machine.status();
        assert_eq!(status.registers[1], 0);
        assert_eq!(status.psd.ia, 0x103);
        assert_eq!(status.instructions, 502);
    }

    #[test]
    fn tooling_access_test() {
        let machine = machine_with("LI,1 0");
        machine.poke(Width::Word, 0x1000, 0xDEAD_BEEF, false).unwrap();
        assert_eq!(machine.peek(Width::Half, 0x1002, false).unwrap(), 0xBEEF);
        assert!(matches!(
            machine.peek(Width::Word, 0x7_0000, false),
            Err(MachineError::Memory(_))
        ));
    }

    #[test]
    fn power_off_test() {
        let mut machine = machine_with(COUNTING);
        machine.start();

        // Holding the control lock makes power off fail without effect
        let shared = Arc::clone(&machine.shared);
        let guard = shared.computer.lock();
        machine.shared.running.store(false, Ordering::Release);
        let timeout = machine.config().power_off_timeout;
        assert_eq!(machine.power_off(), Err(PowerOffError::Timeout(timeout)));
        assert!(machine.shared.powered.load(Ordering::Acquire));
        drop(guard);

        let memory = Arc::downgrade(machine.memory());
        assert_eq!(machine.power_off(), Ok(()));
        let events: Vec<_> = machine.halt_events().try_iter().collect();
        assert_eq!(events.last(), Some(&HaltEvent::Exited));

        // Every page is gone
        assert!(memory.upgrade().is_none());
        assert_eq!(machine.memory().pages(), 0);
        assert!(matches!(
            machine.peek(Width::Word, 0x400, false),
            Err(MachineError::Memory(MemoryError::Nonexistent(0x400)))
        ));
        assert_eq!(machine.power_off(), Ok(()));
    }
}
