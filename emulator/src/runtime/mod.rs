use std::sync::Arc;
use std::time::{Duration, Instant};

use parse_display::Display;
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::codec::{Feature, Instruction, Opcode, OperandClass};
use crate::config::MachineConfig;
use crate::constants::{self as C, Address, Doubleword, Word};

mod breakpoints;
pub(crate) mod clock;
mod decimal;
mod exception;
mod floating;
mod instructions;
mod interrupts;
mod io;
mod mapping;
mod memory;
mod registers;
mod stack;
mod strings;

pub use self::breakpoints::{
    AddressBreakpoint, BreakAction, BreakHit, BreakMode, BreakSource, Breakpoints, Comparator,
    ContextFilter, OpcodeBreakpoint, RegisterCondition, ADDRESS_BREAKPOINTS,
};
pub use self::exception::{Fault, Trap, TrapData};
pub use self::interrupts::{
    always_queues, inhibit_class, CounterCell, InterruptData, InterruptLevel, Interrupts,
    LevelState, LineEvent,
};
pub use self::io::{IoProcessor, IoResult, NullIo};
pub use self::mapping::{Access, VirtualMemory};
pub use self::memory::{AccessCounters, MemoryError, Modified, RealMemory};
pub use self::registers::{ConditionCode, FloatMode, Inhibit, Mode, Psd, RegisterFile};

/// Mask of a 19-bit byte address
const BYTE_ADDRESS_MASK: Address = 0x7_FFFF;

/// Outcome of one processor cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// An instruction, trap or interrupt was processed
    Continue,

    /// Executing WAIT, nothing to service yet
    Waiting,

    /// Spinning on a BCR or BCS to itself, which changes no state
    Idle,

    Halted(HaltReason),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    #[error("{0}")]
    Breakpoint(BreakHit),

    #[error("step complete")]
    StepComplete,

    #[error("fatal fault: {0}")]
    Fault(Fault),
}

/// When to halt after executing instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    #[default]
    Run,

    /// Halt after this many more cycles
    Count(u64),

    /// Halt after a branch instruction transfers control
    BranchTaken,

    /// Halt after a branch instruction falls through
    BranchNotTaken,
}

/// Access width for tooling memory access
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display(style = "lowercase")]
pub enum Width {
    Byte,
    Half,
    Word,
    Doubleword,
}

impl Width {
    #[must_use]
    pub const fn bytes(self) -> Address {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
            Width::Doubleword => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpcodeStats {
    pub count: u64,
    pub time: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistics {
    pub instructions: u64,
    pub traps: u64,
    pub interrupts: u64,

    /// WAIT instructions executed, and the time spent parked on them
    pub waits: u64,
    pub wait_time: Duration,

    pub opcodes: Vec<OpcodeStats>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            instructions: 0,
            traps: 0,
            interrupts: 0,
            waits: 0,
            wait_time: Duration::ZERO,
            opcodes: vec![OpcodeStats::default(); 128],
        }
    }
}

/// Where an operand word lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Register(u8),
    /// Real word address
    Memory(Address),
}

pub struct Computer {
    pub psd: Psd,
    pub registers: RegisterFile,
    pub mapping: VirtualMemory,
    pub breakpoints: Breakpoints,
    memory: Arc<RealMemory>,
    interrupts: Arc<Interrupts>,
    io: Box<dyn IoProcessor>,
    pending_trap: Option<TrapData>,
    fault: Option<Fault>,
    suppress: u8,
    waiting: bool,
    step_mode: StepMode,
    skip_break: Option<Address>,
    data_hit: Option<BreakHit>,
    previous_ia: Option<Address>,
    last_instruction: Option<Instruction>,
    idle_detection: bool,
    profile: bool,
    floating_point: bool,
    decimal: bool,
    statistics: Statistics,
}

impl std::fmt::Debug for Computer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Computer {{ psd: {}, registers: {:08X?}, memory: [...] }}",
            self.psd,
            self.block()
        )
    }
}

impl Default for Computer {
    fn default() -> Self {
        let config = MachineConfig::default();
        Self::new(
            &config,
            Arc::new(RealMemory::new(config.memory_pages)),
            Arc::new(Interrupts::new()),
            Box::new(NullIo),
        )
    }
}

impl Computer {
    #[must_use]
    pub fn new(
        config: &MachineConfig,
        memory: Arc<RealMemory>,
        interrupts: Arc<Interrupts>,
        io: Box<dyn IoProcessor>,
    ) -> Self {
        Self {
            psd: Psd::default(),
            registers: RegisterFile::default(),
            mapping: VirtualMemory::default(),
            breakpoints: Breakpoints::default(),
            memory,
            interrupts,
            io,
            pending_trap: None,
            fault: None,
            suppress: 0,
            waiting: false,
            step_mode: StepMode::Run,
            skip_break: None,
            data_hit: None,
            previous_ia: None,
            last_instruction: None,
            idle_detection: config.idle_detection,
            profile: config.profile,
            floating_point: config.floating_point,
            decimal: config.decimal,
            statistics: Statistics::default(),
        }
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<RealMemory> {
        &self.memory
    }

    #[must_use]
    pub fn interrupts(&self) -> &Arc<Interrupts> {
        &self.interrupts
    }

    pub fn set_io(&mut self, io: Box<dyn IoProcessor>) {
        self.io = io;
    }

    /// Let go of the memory and the devices, leaving `empty` in place of memory
    pub(crate) fn release(&mut self, empty: Arc<RealMemory>) {
        self.memory = empty;
        self.io = Box::new(NullIo);
    }

    #[must_use]
    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    #[must_use]
    pub fn pending_trap(&self) -> Option<TrapData> {
        self.pending_trap
    }

    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    #[must_use]
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Address and word of the last instruction executed
    #[must_use]
    pub fn last_instruction(&self) -> Option<(Address, Instruction)> {
        self.previous_ia.zip(self.last_instruction)
    }

    /// Account for time spent parked on a WAIT
    pub fn record_wait(&mut self, elapsed: Duration) {
        self.statistics.wait_time += elapsed;
    }

    /// Whether an optional instruction group is installed
    #[must_use]
    pub fn installs(&self, feature: Feature) -> bool {
        match feature {
            Feature::Floating => self.floating_point,
            Feature::Decimal => self.decimal,
        }
    }

    #[must_use]
    pub fn step_mode(&self) -> StepMode {
        self.step_mode
    }

    pub fn set_step_mode(&mut self, mode: StepMode) {
        self.step_mode = mode;
    }

    /// Registers of the current block
    #[must_use]
    pub fn block(&self) -> &[Word; C::REGISTERS] {
        self.registers.block(self.psd.rp)
    }

    #[must_use]
    pub fn reg(&self, r: u8) -> Word {
        self.registers.get(self.psd.rp, r)
    }

    pub fn set_reg(&mut self, r: u8, value: Word) {
        self.registers.set(self.psd.rp, r, value);
    }

    #[must_use]
    pub fn reg_pair(&self, r: u8) -> Doubleword {
        self.registers.get_pair(self.psd.rp, r)
    }

    pub fn set_reg_pair(&mut self, r: u8, value: Doubleword) {
        self.registers.set_pair(self.psd.rp, r, value);
    }

    /// Replace the PSD and publish its inhibits to the clock thread
    pub fn set_psd(&mut self, psd: Psd) {
        self.psd = psd;
        self.interrupts.publish_inhibit(psd.inhibit);
    }

    /// System reset: clear the processor, the map and the interrupt controller.
    /// Memory contents and breakpoints are kept.
    #[tracing::instrument(skip(self))]
    pub fn reset(&mut self) {
        self.registers.clear();
        self.mapping.clear();
        self.interrupts.reset();
        self.io.reset();
        self.set_psd(Psd::default());
        self.pending_trap = None;
        self.fault = None;
        self.suppress = 0;
        self.waiting = false;
        self.step_mode = StepMode::Run;
        self.skip_break = None;
        self.data_hit = None;
        self.previous_ia = None;
        self.last_instruction = None;
        self.statistics = Statistics::default();
        debug!("Processor reset");
    }

    /// Reset and install the bootstrap for `device`, ready to run
    ///
    /// # Errors
    ///
    /// Fails if the bootstrap area is not installed.
    pub fn boot(&mut self, device: u16) -> Result<(), MemoryError> {
        self.reset();
        self.load_words(C::BOOTSTRAP_ORIGIN, &C::bootstrap(Word::from(device)))?;
        self.psd.ia = C::BOOTSTRAP_ENTRY;
        debug!(device, "Bootstrap installed");
        Ok(())
    }

    /// Write words into real memory at a word address, ignoring write locks
    ///
    /// # Errors
    ///
    /// Fails if the words run past installed memory.
    pub fn load_words(&self, origin: Address, words: &[Word]) -> Result<(), MemoryError> {
        let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_be_bytes()).collect();
        self.memory.write_bytes(origin * C::WORD_BYTES, &bytes)
    }

    fn tooling_address(&self, address: Address, mapped: bool) -> Address {
        if mapped {
            let word = self.mapping.map_word(address / C::WORD_BYTES);
            word * C::WORD_BYTES + address % C::WORD_BYTES
        } else {
            address
        }
    }

    /// Read memory at a byte address, optionally through the map, without
    /// protection checks
    ///
    /// # Errors
    ///
    /// Fails on misaligned or nonexistent addresses.
    pub fn peek(
        &self,
        width: Width,
        address: Address,
        mapped: bool,
    ) -> Result<Doubleword, MemoryError> {
        let real = self.tooling_address(address, mapped);
        match width {
            Width::Byte => self.memory.load_byte(real).map(Doubleword::from),
            Width::Half => self.memory.load_half(real).map(Doubleword::from),
            Width::Word => self.memory.load_word(real).map(Doubleword::from),
            Width::Doubleword => self.memory.load_doubleword(real),
        }
    }

    /// Write memory at a byte address, optionally through the map, ignoring
    /// write locks
    ///
    /// # Errors
    ///
    /// Fails on misaligned or nonexistent addresses.
    pub fn poke(
        &self,
        width: Width,
        address: Address,
        value: Doubleword,
        mapped: bool,
    ) -> Result<(), MemoryError> {
        let real = self.tooling_address(address, mapped);
        match width {
            Width::Byte => self.memory.store_byte(real, value as u8, 0),
            Width::Half => self.memory.store_half(real, value as u16, 0),
            Width::Word => self.memory.store_word(real, value as Word, 0),
            Width::Doubleword => self.memory.store_doubleword(real, value, 0),
        }
    }

    /// Resolve the effective byte address of a memory-reference instruction
    pub(crate) fn effective_address(
        &mut self,
        instruction: Instruction,
        class: OperandClass,
    ) -> Result<Address, Trap> {
        let mut reference = instruction.reference();
        if instruction.indirect() {
            reference = self.read_word(reference * C::WORD_BYTES)? & C::ADDRESS_MASK;
        }

        let mut address = reference * C::WORD_BYTES;
        if instruction.x() != 0 {
            let index = self.reg(instruction.x());
            address = address.wrapping_add(index.wrapping_mul(class.scale()));
        }
        address &= BYTE_ADDRESS_MASK;

        Ok(match class {
            OperandClass::Doubleword => address & !7,
            OperandClass::Halfword => address & !1,
            OperandClass::Word | OperandClass::Address | OperandClass::Branch => address & !3,
            _ => address,
        })
    }

    fn check_data_break(&mut self, word: Address, real: Address, request: Access) {
        if request == Access::Execute || self.breakpoints.is_empty() {
            return;
        }
        let mapped = self.psd.is_mapped();
        let address = if mapped { word } else { real };
        let memory = &self.memory;
        let hit = self.breakpoints.check_data(address, request == Access::Write, mapped, &|a| {
            memory.load_word(a * C::WORD_BYTES).ok()
        });
        if let Some(hit) = hit {
            self.data_hit.get_or_insert(hit);
        }
    }

    fn locate(&mut self, word: Address, request: Access) -> Result<Location, Trap> {
        let word = word & C::ADDRESS_MASK;
        if word < C::REGISTER_ADDRESSES {
            self.check_data_break(word, word, request);
            return Ok(Location::Register(word as u8));
        }

        let real = self
            .mapping
            .real_address(&self.psd, word, request, self.memory.words())?;
        self.check_data_break(word, real, request);
        Ok(Location::Memory(real))
    }

    /// Real byte address of `address` within the real word `real`
    fn real_byte(real: Address, address: Address) -> Address {
        real * C::WORD_BYTES + address % C::WORD_BYTES
    }

    pub(crate) fn read_byte(&mut self, address: Address) -> Result<u8, Trap> {
        let word = address / C::WORD_BYTES;
        match self.locate(word, Access::Read)? {
            Location::Register(r) => Ok((self.reg(r) >> (24 - 8 * (address % 4))) as u8),
            Location::Memory(real) => self
                .memory
                .load_byte(Self::real_byte(real, address))
                .map_err(|e| Trap::from_memory(e, word)),
        }
    }

    pub(crate) fn read_half(&mut self, address: Address) -> Result<u16, Trap> {
        let word = address / C::WORD_BYTES;
        match self.locate(word, Access::Read)? {
            Location::Register(r) => Ok((self.reg(r) >> (16 - 8 * (address % 4))) as u16),
            Location::Memory(real) => self
                .memory
                .load_half(Self::real_byte(real, address))
                .map_err(|e| Trap::from_memory(e, word)),
        }
    }

    pub(crate) fn read_word(&mut self, address: Address) -> Result<Word, Trap> {
        let word = address / C::WORD_BYTES;
        match self.locate(word, Access::Read)? {
            Location::Register(r) => Ok(self.reg(r)),
            Location::Memory(real) => self
                .memory
                .load_word(real * C::WORD_BYTES)
                .map_err(|e| Trap::from_memory(e, word)),
        }
    }

    pub(crate) fn read_doubleword(&mut self, address: Address) -> Result<Doubleword, Trap> {
        let word = address / C::WORD_BYTES;
        match self.locate(word, Access::Read)? {
            Location::Register(r) => Ok(self.reg_pair(r & !1)),
            Location::Memory(real) => self
                .memory
                .load_doubleword(real * C::WORD_BYTES)
                .map_err(|e| Trap::from_memory(e, word)),
        }
    }

    pub(crate) fn write_byte(&mut self, address: Address, value: u8) -> Result<(), Trap> {
        let word = address / C::WORD_BYTES;
        match self.locate(word, Access::Write)? {
            Location::Register(r) => {
                let shift = 24 - 8 * (address % 4);
                let old = self.reg(r) & !(0xFF << shift);
                self.set_reg(r, old | (Word::from(value) << shift));
                Ok(())
            }
            Location::Memory(real) => self
                .memory
                .store_byte(Self::real_byte(real, address), value, self.psd.wk)
                .map_err(|e| Trap::from_memory(e, word)),
        }
    }

    pub(crate) fn write_half(&mut self, address: Address, value: u16) -> Result<(), Trap> {
        let word = address / C::WORD_BYTES;
        match self.locate(word, Access::Write)? {
            Location::Register(r) => {
                let shift = 16 - 8 * (address % 4);
                let old = self.reg(r) & !(0xFFFF << shift);
                self.set_reg(r, old | (Word::from(value) << shift));
                Ok(())
            }
            Location::Memory(real) => self
                .memory
                .store_half(Self::real_byte(real, address), value, self.psd.wk)
                .map_err(|e| Trap::from_memory(e, word)),
        }
    }

    pub(crate) fn write_word(&mut self, address: Address, value: Word) -> Result<(), Trap> {
        let word = address / C::WORD_BYTES;
        match self.locate(word, Access::Write)? {
            Location::Register(r) => {
                self.set_reg(r, value);
                Ok(())
            }
            Location::Memory(real) => self
                .memory
                .store_word(real * C::WORD_BYTES, value, self.psd.wk)
                .map_err(|e| Trap::from_memory(e, word)),
        }
    }

    pub(crate) fn write_doubleword(
        &mut self,
        address: Address,
        value: Doubleword,
    ) -> Result<(), Trap> {
        let word = address / C::WORD_BYTES;
        match self.locate(word, Access::Write)? {
            Location::Register(r) => {
                self.set_reg_pair(r & !1, value);
                Ok(())
            }
            Location::Memory(real) => self
                .memory
                .store_doubleword(real * C::WORD_BYTES, value, self.psd.wk)
                .map_err(|e| Trap::from_memory(e, word)),
        }
    }

    /// Check that a word store at `address` would not fault, without storing
    /// it or evaluating data breakpoints
    pub(crate) fn check_write_word(&self, address: Address) -> Result<(), Trap> {
        let word = (address / C::WORD_BYTES) & C::ADDRESS_MASK;
        if word < C::REGISTER_ADDRESSES {
            return Ok(());
        }
        let real = self
            .mapping
            .real_address(&self.psd, word, Access::Write, self.memory.words())?;
        self.memory
            .check_store(real * C::WORD_BYTES, C::WORD_BYTES, self.psd.wk)
            .map_err(|e| Trap::from_memory(e, word))
    }

    /// Atomically replace a word with `update(old)`, returning the old value
    pub(crate) fn update_word(
        &mut self,
        address: Address,
        update: impl FnOnce(Word) -> Word,
    ) -> Result<Word, Trap> {
        let word = address / C::WORD_BYTES;
        match self.locate(word, Access::Write)? {
            Location::Register(r) => {
                let old = self.reg(r);
                self.set_reg(r, update(old));
                Ok(old)
            }
            Location::Memory(real) => self
                .memory
                .update_word(real * C::WORD_BYTES, self.psd.wk, update)
                .map_err(|e| Trap::from_memory(e, word)),
        }
    }

    /// Atomically add a signed delta to a byte, halfword or word
    pub(crate) fn modify(
        &mut self,
        address: Address,
        delta: i32,
        size: u8,
    ) -> Result<Modified, Trap> {
        let word = address / C::WORD_BYTES;
        match self.locate(word, Access::Write)? {
            Location::Register(r) => {
                let bits = u32::from(size) * 8;
                let shift = 32 - bits - 8 * (address % 4);
                let mask = if bits == 32 { Word::MAX } else { (1 << bits) - 1 };
                let old = (self.reg(r) >> shift) & mask;
                let modified = memory::add_bits(old, delta as Word, bits);
                let kept = self.reg(r) & !(mask << shift);
                self.set_reg(r, kept | (modified.result << shift));
                Ok(modified)
            }
            Location::Memory(real) => {
                let real = Self::real_byte(real, address);
                let key = self.psd.wk;
                match size {
                    1 => self.memory.modify_byte(real, delta, key),
                    2 => self.memory.modify_half(real, delta, key),
                    _ => self.memory.modify_word(real, delta, key),
                }
                .map_err(|e| Trap::from_memory(e, word))
            }
        }
    }

    /// Fetch the instruction at a word address
    fn fetch(&mut self, ia: Address) -> Result<Word, Trap> {
        match self.locate(ia, Access::Execute)? {
            Location::Register(r) => Ok(self.reg(r)),
            Location::Memory(real) => self
                .memory
                .fetch_word(real * C::WORD_BYTES)
                .map_err(|e| Trap::from_memory(e, ia)),
        }
    }

    /// Store the current PSD at `address` and load a new one from the next doubleword
    #[tracing::instrument(skip(self, old), level = "debug")]
    pub(crate) fn exchange(
        &mut self,
        address: Address,
        r: u8,
        old: Psd,
        trap_cc: Option<ConditionCode>,
    ) -> Result<(), Trap> {
        self.write_doubleword(address, old.to_doubleword())?;
        let value = self.read_doubleword((address + 8) & BYTE_ADDRESS_MASK)?;

        let mut new = Psd::from_doubleword(value);
        if r & 0x8 == 0 {
            new.rp = old.rp;
        }
        if let Some(cc) = trap_cc {
            if r & 0x4 != 0 {
                new.cc |= cc;
            }
            if r & 0x2 != 0 {
                new.ia = (new.ia + Address::from(cc.bits())) & C::ADDRESS_MASK;
            }
        }

        debug!(from = old.ia, to = new.ia, "Exchanged program status");
        self.set_psd(new);
        Ok(())
    }

    /// Run `f` with a master, unmapped PSD and key 0, as the hardware does for
    /// the instruction at a trap or interrupt vector. `f` receives the PSD in
    /// effect before; the temporary PSD is dropped on error.
    fn in_real_mode<T>(
        &mut self,
        f: impl FnOnce(&mut Self, Psd) -> Result<T, Trap>,
    ) -> Result<T, Trap> {
        let current = self.psd;
        self.psd = Psd {
            mode: Mode::empty(),
            ma: false,
            wk: 0,
            ..current
        };
        let result = f(self, current);
        if result.is_err() {
            self.psd = current;
        }
        result
    }

    fn vector_instruction(&self, vector: Address) -> Result<Instruction, Fault> {
        self.memory
            .load_word(vector * C::WORD_BYTES)
            .map(Instruction)
            .map_err(|_| Fault::MissingVector(vector))
    }

    /// Exchange the PSD through the XPSD found at a vector
    fn exchange_through(
        &mut self,
        vector: Address,
        instruction: Instruction,
        trap_cc: Option<ConditionCode>,
    ) -> Result<(), Fault> {
        if instruction.opcode() != Some(Opcode::Xpsd) {
            return Err(Fault::InvalidVector {
                vector,
                word: instruction.0,
            });
        }

        self.in_real_mode(|computer, current| {
            let address = computer.effective_address(instruction, OperandClass::Doubleword)?;
            computer.exchange(address, instruction.r(), current, trap_cc)
        })
        .map_err(|trap| Fault::TrapInExchange { vector, trap })
    }

    #[tracing::instrument(skip(self), level = "debug")]
    fn deliver_trap(&mut self, data: TrapData) -> Result<Address, Fault> {
        let vector = data.vector();
        debug!(trap = %data.trap, vector, "Taking trap");
        self.statistics.traps += 1;
        let instruction = self.vector_instruction(vector)?;
        self.exchange_through(vector, instruction, Some(data.cc()))?;
        self.suppress = 1;
        Ok(vector)
    }

    #[tracing::instrument(skip(self, data), fields(level = data.level), level = "debug")]
    fn deliver_interrupt(&mut self, data: &InterruptData) -> Result<Address, Fault> {
        let vector = C::INTERRUPT_BASE + Address::from(data.level);
        self.statistics.interrupts += 1;
        let instruction = self.vector_instruction(vector)?;

        let counter = data.level.wrapping_sub(C::LEVEL_COUNTER_PULSE);
        match instruction.opcode() {
            Some(op @ (Opcode::Mtb | Opcode::Mth | Opcode::Mtw))
                if usize::from(counter) < C::COUNTERS =>
            {
                self.counter_pulse(vector, counter, instruction, op)?;
            }
            _ => {
                self.exchange_through(vector, instruction, None)?;
                self.suppress = 1;
            }
        }
        Ok(vector)
    }

    /// Execute the modify-and-test instruction at a counter-pulse vector in place
    fn counter_pulse(
        &mut self,
        vector: Address,
        counter: u8,
        instruction: Instruction,
        op: Opcode,
    ) -> Result<(), Fault> {
        let size: u8 = match op {
            Opcode::Mtb => 1,
            Opcode::Mth => 2,
            _ => 4,
        };
        let delta = instruction.delta();

        let (address, modified) = self
            .in_real_mode(|computer, current| {
                let address = computer.effective_address(instruction, op.class())?;
                let modified = computer.modify(address, delta, size)?;
                computer.psd = current;
                Ok((address, modified))
            })
            .map_err(|trap| Fault::TrapInExchange { vector, trap })?;

        let level = C::LEVEL_COUNTER_PULSE + counter;
        self.interrupts.clear(level);
        if address >= C::REGISTER_ADDRESSES * C::WORD_BYTES {
            self.interrupts.register_counter(
                usize::from(counter),
                CounterCell {
                    instruction: instruction.0,
                    address,
                    size,
                    delta,
                },
            );
        }
        if modified.result == 0 {
            self.interrupts.trigger(C::LEVEL_COUNTER_ZERO + counter);
        }
        trace!(counter, result = modified.result, "Counter pulse");
        Ok(())
    }

    /// Latch a fatal fault, or check the trap breakpoint after a successful exchange
    fn settle(&mut self, result: Result<Address, Fault>) -> Step {
        match result {
            Ok(vector) => match self.breakpoints.check_trap(vector) {
                Some(hit) => Step::Halted(HaltReason::Breakpoint(hit)),
                None => Step::Continue,
            },
            Err(fault) => {
                error!(%fault, "Processor halted");
                self.fault = Some(fault.clone());
                Step::Halted(HaltReason::Fault(fault))
            }
        }
    }

    fn check_execute_break(&mut self, ia: Address) -> Option<BreakHit> {
        if self.breakpoints.is_empty() {
            return None;
        }

        let mapped = self.psd.is_mapped();
        let address = if mapped || ia < C::REGISTER_ADDRESSES {
            ia
        } else {
            self.mapping
                .real_address(&self.psd, ia, Access::Execute, self.memory.words())
                .unwrap_or(ia)
        };
        let memory = &self.memory;
        self.breakpoints
            .check_execute(address, self.previous_ia, mapped, &|a| {
                memory.load_word(a * C::WORD_BYTES).ok()
            })
    }

    /// Run one cycle: deliver a pending trap, else take an interrupt, else
    /// execute one instruction.
    pub fn cycle(&mut self) -> Step {
        if let Some(fault) = &self.fault {
            return Step::Halted(HaltReason::Fault(fault.clone()));
        }

        if let Some(trap) = self.pending_trap.take() {
            let result = self.deliver_trap(trap);
            return self.settle(result);
        }

        if self.suppress > 0 {
            self.suppress -= 1;
        } else if let Some(data) = self.interrupts.new_active(self.psd.inhibit) {
            self.waiting = false;
            let result = self.deliver_interrupt(&data);
            return self.settle(result);
        }

        if self.waiting {
            return Step::Waiting;
        }

        let ia = self.psd.ia;
        let resumed = self.skip_break.take() == Some(ia);
        if !resumed {
            if let Some(hit) = self.check_execute_break(ia) {
                self.skip_break = Some(ia);
                return Step::Halted(HaltReason::Breakpoint(hit));
            }
        }

        let word = match self.fetch(ia) {
            Ok(word) => word,
            Err(trap) => {
                self.pending_trap = Some(TrapData { trap, fetch: true });
                return Step::Continue;
            }
        };

        if !resumed && self.breakpoints.opcode.is_some() {
            let registers = *self.block();
            if let Some(hit) = self.breakpoints.check_opcode(ia, word, &registers) {
                self.skip_break = Some(ia);
                return Step::Halted(HaltReason::Breakpoint(hit));
            }
        }

        let instruction = Instruction(word);
        trace!(ia, %instruction, "Executing");
        self.psd.advance();
        self.previous_ia = Some(ia);
        self.last_instruction = Some(instruction);

        let started = self.profile.then(Instant::now);
        let result = instruction.execute(self, 0);
        self.statistics.instructions += 1;
        let stats = &mut self.statistics.opcodes[usize::from(instruction.code())];
        stats.count += 1;
        if let Some(started) = started {
            stats.time += started.elapsed();
        }

        if let Err(trap) = result {
            if trap.aborts() {
                self.psd.ia = ia;
            }
            trace!(%trap, "Instruction trapped");
            self.pending_trap = Some(TrapData { trap, fetch: false });
        }

        if let Some(hit) = self.data_hit.take() {
            return Step::Halted(HaltReason::Breakpoint(hit));
        }

        if self.breakpoints.register.is_some() {
            let registers = *self.block();
            if let Some(hit) = self.breakpoints.check_register(ia, &registers) {
                return Step::Halted(HaltReason::Breakpoint(hit));
            }
        }

        let branched = self.psd.ia != ((ia + 1) & C::ADDRESS_MASK);
        let is_branch = instruction.opcode().is_some_and(Opcode::is_branch);
        match self.step_mode {
            StepMode::Run => {}
            StepMode::Count(remaining) => {
                if remaining <= 1 {
                    self.step_mode = StepMode::Run;
                    return Step::Halted(HaltReason::StepComplete);
                }
                self.step_mode = StepMode::Count(remaining - 1);
            }
            StepMode::BranchTaken if is_branch && branched => {
                self.step_mode = StepMode::Run;
                return Step::Halted(HaltReason::StepComplete);
            }
            StepMode::BranchNotTaken if is_branch && !branched => {
                self.step_mode = StepMode::Run;
                return Step::Halted(HaltReason::StepComplete);
            }
            StepMode::BranchTaken | StepMode::BranchNotTaken => {}
        }

        if self.waiting {
            return Step::Waiting;
        }

        let spinning = matches!(instruction.opcode(), Some(Opcode::Bcr | Opcode::Bcs));
        if self.idle_detection && spinning && self.psd.ia == ia && self.pending_trap.is_none() {
            return Step::Idle;
        }

        Step::Continue
    }

    /// Run cycles until something other than [`Step::Continue`] happens, or `limit` cycles ran
    pub fn run(&mut self, limit: usize) -> Step {
        for _ in 0..limit {
            match self.cycle() {
                Step::Continue => {}
                other => return other,
            }
        }
        Step::Continue
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::codec::parse;

    /// Assemble a listing, one instruction per line
    pub(crate) fn assemble(listing: &str) -> Vec<Word> {
        listing
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| parse(line).map(Word::from).unwrap())
            .collect()
    }

    /// A master-mode computer with a program at X'100'
    pub(crate) fn computer_with(listing: &str) -> Computer {
        let mut computer = Computer::default();
        computer.load_words(0x100, &assemble(listing)).unwrap();
        computer.psd.ia = 0x100;
        computer
    }

    /// Vectors that exchange into handlers at X'300' + vector, saving the PSD
    /// at X'200' + 4 * vector
    pub(crate) fn install_handler(computer: &mut Computer, vector: Address, r: u8) {
        let save = 0x200 + 4 * (vector - 0x40);
        let handler = Psd {
            ia: 0x300 + vector,
            ..Psd::default()
        };
        let (word0, word1) = handler.words();
        computer
            .load_words(vector, &[Word::from(Instruction::from(crate::codec::Fields {
                indirect: false,
                code: Opcode::Xpsd.code(),
                r,
                x: 0,
                reference: save / 2 * 2,
            }))])
            .unwrap();
        computer.load_words(save + 2, &[word0, word1]).unwrap();
    }

    #[test]
    fn step_test() {
        let mut computer = computer_with(indoc! {"
            LI,1    X'42'
            LI,2    X'24'
            AW,2    1
        "});

        assert_eq!(computer.cycle(), Step::Continue);
        assert_eq!(computer.reg(1), 0x42);
        assert_eq!(computer.psd.ia, 0x101);
        computer.cycle();
        computer.cycle();
        assert_eq!(computer.reg(2), 0x66);
        assert_eq!(computer.psd.ia, 0x103);
        assert_eq!(computer.statistics().instructions, 3);
        assert_eq!(computer.statistics().opcodes[0x22].count, 2);
    }

    #[test]
    fn indexing_and_indirection_test() {
        let mut computer = computer_with(indoc! {"
            LI,1    2
            LW,3    X'400',1
            LB,4    X'400',1
            LH,5    X'400',1
            LW,6    *X'410',1
            LD,8    X'400',1
        "});
        let data = [
            0x1111_1111,
            0x2222_2222,
            0x8123_4567,
            0x4444_4444,
            0x5555_5555,
            0x6666_6666,
        ];
        computer.load_words(0x400, &data).unwrap();
        computer.load_words(0x410, &[0x402]).unwrap();

        computer.run(6);
        assert_eq!(computer.reg(3), 0x8123_4567);
        assert_eq!(computer.reg(4), 0x11);
        assert_eq!(computer.reg(5), 0x2222);
        // Indirect word X'402' indexed by 2 words
        assert_eq!(computer.reg(6), 0x5555_5555);
        // Doubleword index is scaled by 8
        assert_eq!((computer.reg(8), computer.reg(9)), (0x5555_5555, 0x6666_6666));
    }

    #[test]
    fn register_addresses_test() {
        let mut computer = computer_with(indoc! {"
            LI,5    7
            LW,6    5
            STW,6   9
            LI,1    3
            STB,1   X'A'
        "});

        computer.run(5);
        assert_eq!(computer.reg(6), 7);
        assert_eq!(computer.reg(9), 7);
        assert_eq!(computer.reg(10), 0x0300_0000);
    }

    #[test]
    fn register_block_switch_test() {
        let mut computer = computer_with(indoc! {"
            LI,1    1
            LRP     X'400'
            LI,1    2
        "});
        computer.load_words(0x400, &[0x0000_0030]).unwrap();

        computer.run(3);
        assert_eq!(computer.psd.rp, 3);
        assert_eq!(computer.registers.get(0, 1), 1);
        assert_eq!(computer.registers.get(3, 1), 2);
    }

    #[test]
    fn nonexistent_instruction_trap_test() {
        let mut computer = computer_with(indoc! {"
            DATA    X'00000000'
        "});
        install_handler(&mut computer, C::TRAP_NONEXISTENT, 0b0100);

        assert_eq!(computer.cycle(), Step::Continue);
        assert_eq!(
            computer.pending_trap(),
            Some(TrapData {
                trap: Trap::NonexistentInstruction,
                fetch: false
            })
        );
        // Aborted: the address still points at the instruction
        assert_eq!(computer.psd.ia, 0x100);

        assert_eq!(computer.cycle(), Step::Continue);
        assert_eq!(computer.psd.ia, 0x340);
        assert_eq!(computer.psd.cc, ConditionCode::CC1);

        let saved = computer.peek(Width::Doubleword, 0x200 * 4, false).unwrap();
        assert_eq!(Psd::from_doubleword(saved).ia, 0x100);
    }

    #[test]
    fn unimplemented_trap_test() {
        let config = MachineConfig::default().without(Feature::Decimal);
        let mut computer = Computer::new(
            &config,
            Arc::new(RealMemory::new(config.memory_pages)),
            Arc::new(Interrupts::new()),
            Box::new(NullIo),
        );
        computer
            .load_words(0x100, &assemble(indoc! {"
                DL,2    X'400'
                FAS,2   X'400'
            "}))
            .unwrap();
        computer.psd.ia = 0x100;
        install_handler(&mut computer, C::TRAP_UNIMPLEMENTED, 0);
        assert!(!computer.installs(Feature::Decimal));
        assert!(computer.installs(Feature::Floating));

        assert_eq!(computer.cycle(), Step::Continue);
        assert_eq!(
            computer.pending_trap(),
            Some(TrapData {
                trap: Trap::Unimplemented,
                fetch: false
            })
        );
        assert_eq!(computer.psd.ia, 0x100);

        computer.cycle();
        assert_eq!(computer.psd.ia, 0x341);
        let saved = computer.peek(Width::Doubleword, 0x204 * 4, false).unwrap();
        assert_eq!(Psd::from_doubleword(saved).ia, 0x100);

        // The floating group is still there
        computer.psd.ia = 0x101;
        computer.cycle();
        assert_eq!(computer.pending_trap(), None);
        assert_eq!(computer.psd.ia, 0x102);
    }

    #[test]
    fn privileged_trap_test() {
        let mut computer = computer_with(indoc! {"
            WAIT
        "});
        computer.psd.mode = Mode::SLAVE;
        install_handler(&mut computer, C::TRAP_NONEXISTENT, 0b0110);

        computer.cycle();
        computer.cycle();
        // CC3 added to the new address and ORed into the new CC
        assert_eq!(computer.psd.ia, 0x342);
        assert_eq!(computer.psd.cc, ConditionCode::CC3);
        assert!(computer.psd.is_master());
    }

    #[test]
    fn nonexistent_address_test() {
        let config = MachineConfig::default().with_memory_pages(4);
        let mut computer = Computer::new(
            &config,
            Arc::new(RealMemory::new(4)),
            Arc::new(Interrupts::new()),
            Box::new(NullIo),
        );
        computer.load_words(0x100, &assemble("LW,1 X'1000'")).unwrap();
        computer.psd.ia = 0x100;
        install_handler(&mut computer, C::TRAP_NONEXISTENT, 0b0100);

        computer.cycle();
        assert_eq!(computer.pending_trap().map(|t| t.trap), Some(Trap::NonexistentAddress(0x1000)));
        computer.cycle();
        assert_eq!(computer.psd.cc, ConditionCode::CC2);
    }

    #[test]
    fn fetch_trap_does_not_back_up_test() {
        let mut computer = Computer::default();
        computer.psd = Psd {
            mode: Mode::SLAVE | Mode::MAPPED,
            ia: 0x600,
            ..Psd::default()
        };
        // Page 3 (X'600'–X'7FF') maps to real page 3, no access
        computer.mapping.set_map(0, 0x0001_0203);
        computer.mapping.set_access(0, 3 << 24);
        install_handler(&mut computer, C::TRAP_NONEXISTENT, 0);

        computer.cycle();
        assert_eq!(
            computer.pending_trap(),
            Some(TrapData {
                trap: Trap::Protection(0x600),
                fetch: true
            })
        );
        assert_eq!(computer.psd.ia, 0x600);
    }

    #[test]
    fn write_lock_trap_test() {
        let mut computer = computer_with(indoc! {"
            STW,1   X'800'
        "});
        computer.memory().set_lock(4, 1);
        computer.psd.wk = 2;
        computer.set_reg(1, 99);
        install_handler(&mut computer, C::TRAP_NONEXISTENT, 0b0100);

        computer.cycle();
        assert_eq!(computer.pending_trap().map(|t| t.trap), Some(Trap::Protection(0x800)));
        assert_eq!(computer.memory().load_word(0x800 * 4).unwrap(), 0);
        computer.cycle();
        assert_eq!(computer.psd.cc, ConditionCode::CC4);
    }

    #[test]
    fn invalid_vector_is_fatal_test() {
        let mut computer = computer_with("DATA X'00000000'");
        computer.cycle();

        assert_eq!(
            computer.cycle(),
            Step::Halted(HaltReason::Fault(Fault::InvalidVector {
                vector: C::TRAP_NONEXISTENT,
                word: 0
            }))
        );
        // Latched until reset
        assert!(matches!(computer.cycle(), Step::Halted(HaltReason::Fault(_))));
        computer.reset();
        assert_eq!(computer.fault(), None);
    }

    #[test]
    fn interrupt_test() {
        let mut computer = computer_with(indoc! {"
            LI,1    1
            LI,1    2
        "});
        let vector = C::INTERRUPT_BASE + Address::from(C::LEVEL_EXTERNAL);
        install_handler(&mut computer, vector, 0);
        computer.load_words(0x300 + vector, &assemble("LI,2 5")).unwrap();
        computer.interrupts().arm(C::LEVEL_EXTERNAL);
        computer.interrupts().enable(C::LEVEL_EXTERNAL);

        computer.cycle();
        computer.interrupts().trigger(C::LEVEL_EXTERNAL);
        assert_eq!(computer.cycle(), Step::Continue);
        assert_eq!(computer.psd.ia, 0x300 + vector);
        assert_eq!(computer.interrupts().highest_active(), Some(C::LEVEL_EXTERNAL));

        let save = (0x200 + 4 * (vector - 0x40)) * 4;
        let saved = computer.peek(Width::Doubleword, save, false).unwrap();
        assert_eq!(Psd::from_doubleword(saved).ia, 0x101);

        computer.cycle();
        assert_eq!(computer.reg(2), 5);
    }

    #[test]
    fn external_inhibit_test() {
        let mut computer = computer_with(indoc! {"
            LI,1    1
            LI,1    2
        "});
        computer.psd.inhibit = Inhibit::EXTERNAL;
        computer.interrupts().arm(20);
        computer.interrupts().enable(20);
        computer.interrupts().trigger(20);

        computer.run(2);
        assert_eq!(computer.psd.ia, 0x102);
        assert_eq!(computer.interrupts().level(20).state, LevelState::Waiting);
    }

    #[test]
    fn trap_before_interrupt_test() {
        let mut computer = computer_with(indoc! {"
            CAL1,5  0
        "});
        install_handler(&mut computer, C::TRAP_CAL1, 0b0100);
        let vector = C::INTERRUPT_BASE + 16;
        install_handler(&mut computer, vector, 0);
        computer.interrupts().arm(16);
        computer.interrupts().enable(16);

        computer.cycle();
        computer.interrupts().trigger(16);

        // The trap raised by CAL1 goes first
        computer.cycle();
        assert_eq!(computer.psd.ia, 0x300 + C::TRAP_CAL1);
        assert_eq!(computer.psd.cc, ConditionCode::CC2 | ConditionCode::CC4);

        // One instruction of the handler runs before the interrupt
        computer.load_words(0x300 + C::TRAP_CAL1, &assemble("LI,3 1")).unwrap();
        computer.cycle();
        assert_eq!(computer.reg(3), 1);
        computer.cycle();
        assert_eq!(computer.psd.ia, 0x300 + vector);
    }

    #[test]
    fn counter_pulse_test() {
        let mut computer = computer_with("LI,1 0");
        // MTW,-1 X'500' at counter 1 pulse vector
        computer.load_words(0x52, &[0x33F0_0500]).unwrap();
        computer.load_words(0x500, &[2]).unwrap();
        for level in [C::LEVEL_COUNTER_PULSE, C::LEVEL_COUNTER_ZERO] {
            computer.interrupts().arm(level);
            computer.interrupts().enable(level);
        }

        computer.interrupts().trigger(C::LEVEL_COUNTER_PULSE);
        computer.cycle();
        assert_eq!(computer.memory().load_word(0x500 * 4).unwrap(), 1);
        assert_eq!(computer.psd.ia, 0x100);
        assert_eq!(computer.interrupts().level(C::LEVEL_COUNTER_PULSE).state, LevelState::Armed);
        assert_eq!(
            computer.interrupts().counter(0),
            Some(CounterCell {
                instruction: 0x33F0_0500,
                address: 0x500 * 4,
                size: 4,
                delta: -1
            })
        );

        computer.interrupts().trigger(C::LEVEL_COUNTER_PULSE);
        computer.cycle();
        assert_eq!(computer.memory().load_word(0x500 * 4).unwrap(), 0);
        assert_eq!(computer.interrupts().level(C::LEVEL_COUNTER_ZERO).state, LevelState::Waiting);
    }

    #[test]
    fn breakpoint_test() {
        let mut computer = computer_with(indoc! {"
            LI,1    1
            LI,1    2
            STW,1   X'400'
            LI,1    3
        "});
        computer.breakpoints.add(AddressBreakpoint::at(0x101));
        computer.breakpoints.add(AddressBreakpoint {
            mode: BreakMode::UNMAPPED | BreakMode::WRITE,
            ..AddressBreakpoint::at(0x400)
        });

        assert_eq!(
            computer.run(10),
            Step::Halted(HaltReason::Breakpoint(BreakHit {
                source: BreakSource::Address(0),
                address: 0x101
            }))
        );
        assert_eq!(computer.psd.ia, 0x101);

        // Resuming skips the breakpoint once, then the write stops after the store
        assert_eq!(
            computer.run(10),
            Step::Halted(HaltReason::Breakpoint(BreakHit {
                source: BreakSource::Address(1),
                address: 0x400
            }))
        );
        assert_eq!(computer.psd.ia, 0x103);
        assert_eq!(computer.memory().load_word(0x400 * 4).unwrap(), 2);
    }

    #[test]
    fn step_modes_test() {
        let mut computer = computer_with(indoc! {"
            LI,1    2
            BDR,1   X'101'
            LI,2    1
            BCR,0   X'103'
        "});

        computer.set_step_mode(StepMode::Count(2));
        assert_eq!(computer.run(10), Step::Halted(HaltReason::StepComplete));
        assert_eq!(computer.psd.ia, 0x101);

        computer.set_step_mode(StepMode::BranchNotTaken);
        assert_eq!(computer.run(10), Step::Halted(HaltReason::StepComplete));
        assert_eq!(computer.psd.ia, 0x102);
        assert_eq!(computer.reg(1), 0);

        // Tight loop on itself
        assert_eq!(computer.run(10), Step::Idle);
        assert_eq!(computer.psd.ia, 0x103);
    }

    #[test]
    fn countdown_is_not_idle_test() {
        let mut computer = computer_with(indoc! {"
            LI,1    500
            BDR,1   X'101'
            BIR,2   X'102'
            BCS,0   X'103'
        "});
        computer.set_reg(2, (-3i32) as Word);

        assert_eq!(computer.run(501), Step::Continue);
        assert_eq!(computer.psd.ia, 0x102);
        assert_eq!(computer.reg(1), 0);

        assert_eq!(computer.run(3), Step::Continue);
        assert_eq!(computer.psd.ia, 0x103);
        assert_eq!(computer.reg(2), 0);

        // BCS,0 never branches
        assert_eq!(computer.run(1), Step::Continue);
        assert_eq!(computer.psd.ia, 0x104);
    }

    #[test]
    fn wait_test() {
        let mut computer = computer_with(indoc! {"
            WAIT
            LI,1    1
        "});
        let vector = C::INTERRUPT_BASE + 16;
        install_handler(&mut computer, vector, 0);
        computer.interrupts().arm(16);
        computer.interrupts().enable(16);

        assert_eq!(computer.cycle(), Step::Waiting);
        assert_eq!(computer.cycle(), Step::Waiting);
        assert!(computer.is_waiting());

        computer.interrupts().trigger(16);
        assert_eq!(computer.cycle(), Step::Continue);
        assert!(!computer.is_waiting());
        let save = (0x200 + 4 * (vector - 0x40)) * 4;
        let saved = computer.peek(Width::Doubleword, save, false).unwrap();
        assert_eq!(Psd::from_doubleword(saved).ia, 0x101);
    }

    #[test]
    fn tooling_access_test() {
        let mut computer = Computer::default();
        computer.mapping.set_map(4, 0x0A00_0000);
        computer.poke(Width::Word, 4 * 512 * 4 + 8, 0xCAFE_F00D, true).unwrap();
        assert_eq!(computer.peek(Width::Word, 0x0A * 512 * 4 + 8, false).unwrap(), 0xCAFE_F00D);
        assert_eq!(computer.peek(Width::Half, 4 * 512 * 4 + 10, true).unwrap(), 0xF00D);
        assert!(computer.peek(Width::Word, 0x10_0000, false).is_err());
        computer.psd.ia = 7;
        computer.reset();
        assert_eq!(computer.psd, Psd::default());
    }

    #[test]
    fn boot_test() {
        use std::sync::Mutex;

        /// A card reader holding one record, busy for a few tests after starting
        struct Reader {
            memory: Arc<RealMemory>,
            record: Vec<u8>,
            busy: u32,
            started: Arc<Mutex<Vec<(u16, Address)>>>,
        }

        impl IoProcessor for Reader {
            fn start(&mut self, unit: u16, command: Address) -> IoResult {
                self.started.lock().unwrap().push((unit, command));
                let order = self.memory.load_doubleword(command * 8).unwrap();
                let address = ((order >> 32) as Word) & 0x00FF_FFFF;
                let count = (order & 0xFFFF) as usize;
                let record = &self.record[..count.min(self.record.len())];
                self.memory.write_bytes(address, record).unwrap();
                self.busy = 3;
                IoResult::accepted(0, 0)
            }

            fn test(&mut self, _unit: u16) -> IoResult {
                if self.busy > 0 {
                    self.busy -= 1;
                    IoResult {
                        cc: ConditionCode::CC2,
                        ..IoResult::default()
                    }
                } else {
                    IoResult::accepted(0, 0)
                }
            }

            fn test_device(&mut self, _unit: u16) -> IoResult {
                IoResult::accepted(0, 0)
            }

            fn halt(&mut self, _unit: u16) -> IoResult {
                IoResult::accepted(0, 0)
            }
        }

        let program = assemble(indoc! {"
            LI,5    42
            BCR,0   X'2B'
        "});
        let record: Vec<u8> = program.iter().flat_map(|w| w.to_be_bytes()).collect();

        let mut computer = Computer::default();
        let started = Arc::new(Mutex::new(Vec::new()));
        computer.set_io(Box::new(Reader {
            memory: Arc::clone(computer.memory()),
            record,
            busy: 0,
            started: Arc::clone(&started),
        }));
        computer.boot(0x0F0).unwrap();

        assert_eq!(computer.psd.ia, C::BOOTSTRAP_ENTRY);
        assert_eq!(computer.memory().load_word(C::BOOTSTRAP_DEVICE * 4).unwrap(), 0x0F0);

        assert_eq!(computer.run(100), Step::Idle);
        assert_eq!(*started.lock().unwrap(), vec![(0x0F0, 0x10)]);
        assert_eq!(computer.reg(5), 42);
        assert_eq!(computer.psd.ia, 0x2B);
    }
}
