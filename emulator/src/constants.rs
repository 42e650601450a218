//! Architectural constants: sizes, fixed memory locations and vector addresses.

/// A 32-bit machine word
pub type Word = u32;

/// A 64-bit doubleword, first word in the high half
pub type Doubleword = u64;

/// A real or virtual byte address
pub type Address = u32;

/// Bytes per word
pub const WORD_BYTES: Address = 4;

/// Words per page
pub const PAGE_WORDS: Address = 512;

/// Bytes per page
pub const PAGE_BYTES: Address = PAGE_WORDS * WORD_BYTES;

/// Number of pages in the 17-bit virtual address space
pub const VIRTUAL_PAGES: usize = 256;

/// Largest real memory the wide map and the extension register can reach (4M words)
pub const MAX_PAGES: usize = 8192;

/// Default real memory size: 128K words
pub const DEFAULT_PAGES: usize = 256;

/// Pages covered by the write-lock table
pub const WRITE_LOCK_PAGES: usize = 256;

/// Mask of a 17-bit word address
pub const ADDRESS_MASK: Word = 0x1_FFFF;

/// Word addresses below this value designate the current register block
pub const REGISTER_ADDRESSES: Address = 16;

/// Number of general registers in a block
pub const REGISTERS: usize = 16;

/// Number of register blocks selectable by the register pointer
pub const REGISTER_BLOCKS: usize = 16;

/// Trap vector: nonexistent instruction, nonexistent address, privilege or protection violation
pub const TRAP_NONEXISTENT: Address = 0x40;

/// Trap vector: unimplemented instruction
pub const TRAP_UNIMPLEMENTED: Address = 0x41;

/// Trap vector: push-down stack limit
pub const TRAP_STACK_LIMIT: Address = 0x42;

/// Trap vector: fixed-point overflow
pub const TRAP_FIXED_OVERFLOW: Address = 0x43;

/// Trap vector: floating-point fault
pub const TRAP_FLOATING: Address = 0x44;

/// Trap vector: decimal arithmetic fault
pub const TRAP_DECIMAL: Address = 0x45;

/// Trap vector: watchdog timer
pub const TRAP_WATCHDOG: Address = 0x46;

/// Trap vector of CAL1; CAL2–CAL4 follow
pub const TRAP_CAL1: Address = 0x48;

/// Interrupt vector of level 0; level `n` lives at `INTERRUPT_BASE + n`
pub const INTERRUPT_BASE: Address = 0x50;

/// Number of interrupt levels
pub const INTERRUPT_LEVELS: usize = 32;

/// Power-on interrupt level
pub const LEVEL_POWER_ON: u8 = 0;

/// Power-off interrupt level
pub const LEVEL_POWER_OFF: u8 = 1;

/// Counter 1 pulse level; counters 2–4 follow
pub const LEVEL_COUNTER_PULSE: u8 = 2;

/// Memory parity interrupt level
pub const LEVEL_MEMORY_PARITY: u8 = 6;

/// Counter 1 equals-zero level; counters 2–4 follow
pub const LEVEL_COUNTER_ZERO: u8 = 8;

/// I/O interrupt level
pub const LEVEL_IO: u8 = 12;

/// Control panel interrupt level
pub const LEVEL_PANEL: u8 = 13;

/// First external interrupt level
pub const LEVEL_EXTERNAL: u8 = 16;

/// Number of real-time counters
pub const COUNTERS: usize = 4;

/// Bounds the chain of EXU instructions executing each other
pub const EXU_LIMIT: usize = 64;

/// Where the IPL bootstrap is written
pub const BOOTSTRAP_ORIGIN: Address = 0x20;

/// Instruction address the bootstrap starts at
pub const BOOTSTRAP_ENTRY: Address = 0x26;

/// Word holding the boot device address within the bootstrap
pub const BOOTSTRAP_DEVICE: Address = 0x25;

/// Where the bootstrap's read order deposits the first record
pub const BOOTSTRAP_LOAD: Address = 0x2A;

/// The IPL bootstrap, written at `BOOTSTRAP_ORIGIN` with the boot device in word X'25'.
///
/// ```text
/// 20  READ  X'A8', 88 bytes      command doubleword
/// 22  status doubleword
/// 24  X'10'                      command doubleword address
/// 25  device address
/// 26  LW,0   X'24'
/// 27  SIO,0  *X'25'
/// 28  TIO,0  *X'25'
/// 29  BCS,12 X'28'
/// ```
#[must_use]
pub const fn bootstrap(device: Word) -> [Word; 10] {
    [
        0x0200_00A8,
        0x0E00_0058,
        0x0000_0000,
        0x0000_0000,
        0x0000_0010,
        device,
        0x3200_0024,
        0xCC00_0025,
        0xCD00_0025,
        0x69C0_0028,
    ]
}
