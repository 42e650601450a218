use thiserror::Error;

use super::memory::MemoryError;
use super::registers::ConditionCode;
use crate::constants::{self as C, Address, Word};

/// A guest-visible fault or call, resolved by exchanging the PSD through a trap vector
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    #[error("nonexistent instruction")]
    NonexistentInstruction,

    #[error("nonexistent address {0:#x}")]
    NonexistentAddress(Address),

    #[error("privileged instruction in slave mode")]
    Privileged,

    #[error("memory protection violation at {0:#x}")]
    Protection(Address),

    #[error("unimplemented instruction")]
    Unimplemented,

    /// Push-down limit reached with the trap not inhibited
    #[error("stack limit")]
    StackLimit { space: bool, words: bool },

    #[error("fixed-point overflow")]
    FixedOverflow,

    #[error("floating-point fault")]
    Floating(ConditionCode),

    #[error("decimal fault")]
    Decimal(ConditionCode),

    #[error("watchdog timer")]
    Watchdog,

    /// CAL1 to CAL4, with the R field of the instruction
    #[error("CAL{number}")]
    Call { number: u8, code: u8 },
}

impl Trap {
    #[must_use]
    pub const fn vector(&self) -> Address {
        match self {
            Trap::NonexistentInstruction
            | Trap::NonexistentAddress(_)
            | Trap::Privileged
            | Trap::Protection(_) => C::TRAP_NONEXISTENT,
            Trap::Unimplemented => C::TRAP_UNIMPLEMENTED,
            Trap::StackLimit { .. } => C::TRAP_STACK_LIMIT,
            Trap::FixedOverflow => C::TRAP_FIXED_OVERFLOW,
            Trap::Floating(_) => C::TRAP_FLOATING,
            Trap::Decimal(_) => C::TRAP_DECIMAL,
            Trap::Watchdog => C::TRAP_WATCHDOG,
            Trap::Call { number, .. } => C::TRAP_CAL1 + (*number as Address - 1),
        }
    }

    /// Condition codes handed to the trap handler
    #[must_use]
    pub fn cc(&self) -> ConditionCode {
        match self {
            Trap::NonexistentInstruction => ConditionCode::CC1,
            Trap::NonexistentAddress(_) => ConditionCode::CC2,
            Trap::Privileged => ConditionCode::CC3,
            Trap::Protection(_) => ConditionCode::CC4,
            Trap::StackLimit { space, words } => {
                let mut cc = ConditionCode::empty();
                cc.set(ConditionCode::CC1, *space);
                cc.set(ConditionCode::CC3, *words);
                cc
            }
            Trap::Floating(cc) | Trap::Decimal(cc) => *cc,
            Trap::Call { code, .. } => ConditionCode::from_bits_truncate(*code),
            Trap::Unimplemented | Trap::FixedOverflow | Trap::Watchdog => ConditionCode::empty(),
        }
    }

    /// Whether the stored PSD points back at the trapping instruction
    #[must_use]
    pub const fn aborts(&self) -> bool {
        !matches!(
            self,
            Trap::Call { .. } | Trap::FixedOverflow | Trap::Watchdog
        )
    }

    pub(crate) fn from_memory(error: MemoryError, virtual_address: Address) -> Self {
        match error {
            MemoryError::WriteLocked { .. } => Trap::Protection(virtual_address),
            MemoryError::Nonexistent(_) | MemoryError::Misaligned(_) => {
                Trap::NonexistentAddress(virtual_address)
            }
        }
    }
}

/// A trap waiting to be delivered at the start of the next cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapData {
    pub trap: Trap,

    /// The trap hit the instruction fetch; the address is not backed up
    pub fetch: bool,
}

impl TrapData {
    #[must_use]
    pub const fn vector(&self) -> Address {
        self.trap.vector()
    }

    #[must_use]
    pub fn cc(&self) -> ConditionCode {
        self.trap.cc()
    }
}

/// An internal inconsistency that stops the processor until reset
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("vector {vector:#x} holds {word:#010x}, which cannot service it")]
    InvalidVector { vector: Address, word: Word },

    #[error("{trap} while exchanging program status through {vector:#x}")]
    TrapInExchange { vector: Address, trap: Trap },

    #[error("nonexistent memory at vector {0:#x}")]
    MissingVector(Address),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_test() {
        assert_eq!(Trap::Privileged.vector(), 0x40);
        assert_eq!(Trap::Privileged.cc(), ConditionCode::CC3);
        assert_eq!(Trap::Protection(0x400).cc(), ConditionCode::CC4);
        assert_eq!(Trap::Unimplemented.vector(), 0x41);
        assert_eq!(Trap::Watchdog.vector(), 0x46);
        assert_eq!(Trap::Call { number: 3, code: 5 }.vector(), 0x4A);
        assert_eq!(
            Trap::Call { number: 3, code: 5 }.cc(),
            ConditionCode::CC2 | ConditionCode::CC4
        );
        assert_eq!(
            Trap::StackLimit {
                space: false,
                words: true
            }
            .cc(),
            ConditionCode::CC3
        );
    }

    #[test]
    fn abort_test() {
        assert!(Trap::NonexistentInstruction.aborts());
        assert!(Trap::StackLimit {
            space: true,
            words: false
        }
        .aborts());
        assert!(!Trap::FixedOverflow.aborts());
        assert!(!Trap::Call { number: 1, code: 0 }.aborts());
    }
}
