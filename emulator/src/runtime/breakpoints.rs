//! Breakpoints checked by the processor.
//!
//! There are five address breakpoints, one opcode-pattern breakpoint
//! (optionally ANDed with a register condition), one standalone register
//! breakpoint and one trap-vector breakpoint. Every breakpoint either halts
//! the processor or, while its log counter lasts, logs the hit and lets
//! execution go on.

use bitflags::bitflags;
use parse_display::Display;
use tracing::info;

use crate::constants::{Address, Word};

/// Number of address breakpoint slots
pub const ADDRESS_BREAKPOINTS: usize = 5;

bitflags! {
    /// What an address breakpoint reacts to
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BreakMode: u8 {
        /// References made in mapped mode, compared against virtual addresses
        const MAPPED     = 0b00_0001;
        /// References made in unmapped mode, compared against real addresses
        const UNMAPPED   = 0b00_0010;
        /// Instruction fetches
        const EXECUTE    = 0b00_0100;
        /// Operand reads
        const READ       = 0b00_1000;
        /// Operand writes
        const WRITE      = 0b01_0000;
        /// Only fetches arriving from outside the range
        const TRANSITION = 0b10_0000;
    }
}

impl Default for BreakMode {
    fn default() -> Self {
        Self::MAPPED | Self::UNMAPPED | Self::EXECUTE
    }
}

/// Predicate on a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Comparator {
    #[display("== {0:#x}")]
    Eq(Word),
    #[display("!= {0:#x}")]
    Ne(Word),
    #[display("< {0:#x}")]
    Lt(Word),
    #[display("> {0:#x}")]
    Gt(Word),
    /// Any of the given bits set
    #[display("& {0:#x}")]
    Any(Word),
}

impl Comparator {
    #[must_use]
    pub fn check(&self, operand: Word) -> bool {
        match *self {
            Comparator::Eq(value) => operand == value,
            Comparator::Ne(value) => operand != value,
            Comparator::Lt(value) => operand < value,
            Comparator::Gt(value) => operand > value,
            Comparator::Any(bits) => operand & bits != 0,
        }
    }
}

/// A condition on a register of the current block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("R{register} {comparator}")]
pub struct RegisterCondition {
    pub register: u8,
    pub comparator: Comparator,
}

impl RegisterCondition {
    #[must_use]
    pub fn check(&self, registers: &[Word; 16]) -> bool {
        self.comparator
            .check(registers[usize::from(self.register) % registers.len()])
    }
}

/// Restrict a breakpoint to hits while a real memory word holds a value,
/// typically the current task identifier of the guest system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextFilter {
    /// Real word address
    pub address: Address,
    pub value: Word,
}

/// What happens on a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BreakAction {
    #[default]
    Halt,

    /// Log this many hits before halting
    Log(u32),
}

impl BreakAction {
    /// Account for a hit, returning true if it halts
    fn hit(&mut self) -> bool {
        match self {
            BreakAction::Halt => true,
            BreakAction::Log(0) => {
                *self = BreakAction::Halt;
                true
            }
            BreakAction::Log(remaining) => {
                *remaining -= 1;
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressBreakpoint {
    /// First word address of the range
    pub start: Address,
    /// Last word address of the range, inclusive
    pub end: Address,
    pub mode: BreakMode,
    pub context: Option<ContextFilter>,
    pub action: BreakAction,
}

impl AddressBreakpoint {
    #[must_use]
    pub fn at(address: Address) -> Self {
        Self {
            start: address,
            end: address,
            mode: BreakMode::default(),
            context: None,
            action: BreakAction::Halt,
        }
    }

    fn contains(&self, address: Address) -> bool {
        (self.start..=self.end).contains(&address)
    }

    fn applies(&self, mapped: bool) -> bool {
        self.mode.contains(if mapped {
            BreakMode::MAPPED
        } else {
            BreakMode::UNMAPPED
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpcodeBreakpoint {
    /// Instruction bits to match, under `mask`
    pub value: Word,
    pub mask: Word,
    pub condition: Option<RegisterCondition>,
    pub action: BreakAction,
}

/// Which breakpoint was hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum BreakSource {
    #[display("address breakpoint {0}")]
    Address(usize),
    #[display("opcode breakpoint")]
    Opcode,
    #[display("register breakpoint")]
    Register,
    #[display("trap breakpoint")]
    Trap,
}

/// A halting breakpoint hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{source} at X'{address:X}'")]
pub struct BreakHit {
    pub source: BreakSource,
    pub address: Address,
}

/// Every breakpoint of a processor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Breakpoints {
    pub address: [Option<AddressBreakpoint>; ADDRESS_BREAKPOINTS],
    pub opcode: Option<OpcodeBreakpoint>,
    pub register: Option<RegisterCondition>,
    pub register_action: BreakAction,
    /// Trap or interrupt vector address
    pub trap: Option<Address>,
}

impl Breakpoints {
    /// Put an address breakpoint in the first free slot, returning the slot
    pub fn add(&mut self, breakpoint: AddressBreakpoint) -> Option<usize> {
        let slot = self.address.iter().position(Option::is_none)?;
        self.address[slot] = Some(breakpoint);
        Some(slot)
    }

    pub fn remove(&mut self, slot: usize) -> Option<AddressBreakpoint> {
        self.address.get_mut(slot).and_then(Option::take)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.address.iter().all(Option::is_none)
            && self.opcode.is_none()
            && self.register.is_none()
            && self.trap.is_none()
    }

    fn check_address(
        &mut self,
        address: Address,
        previous: Option<Address>,
        mapped: bool,
        kind: BreakMode,
        context: &dyn Fn(Address) -> Option<Word>,
    ) -> Option<BreakHit> {
        for (slot, entry) in self.address.iter_mut().enumerate() {
            let Some(breakpoint) = entry else { continue };

            if !breakpoint.mode.contains(kind)
                || !breakpoint.applies(mapped)
                || !breakpoint.contains(address)
            {
                continue;
            }

            if kind == BreakMode::EXECUTE
                && breakpoint.mode.contains(BreakMode::TRANSITION)
                && previous.is_some_and(|previous| breakpoint.contains(previous))
            {
                continue;
            }

            if let Some(filter) = breakpoint.context {
                if context(filter.address) != Some(filter.value) {
                    continue;
                }
            }

            if breakpoint.action.hit() {
                return Some(BreakHit {
                    source: BreakSource::Address(slot),
                    address,
                });
            }
            info!(slot, address, action = ?breakpoint.action, "Breakpoint logged");
        }
        None
    }

    /// Check an instruction fetch at `address`, coming from `previous`
    pub fn check_execute(
        &mut self,
        address: Address,
        previous: Option<Address>,
        mapped: bool,
        context: &dyn Fn(Address) -> Option<Word>,
    ) -> Option<BreakHit> {
        self.check_address(address, previous, mapped, BreakMode::EXECUTE, context)
    }

    /// Check an operand reference
    pub fn check_data(
        &mut self,
        address: Address,
        write: bool,
        mapped: bool,
        context: &dyn Fn(Address) -> Option<Word>,
    ) -> Option<BreakHit> {
        let kind = if write { BreakMode::WRITE } else { BreakMode::READ };
        self.check_address(address, None, mapped, kind, context)
    }

    /// Check a fetched instruction word against the opcode breakpoint
    pub fn check_opcode(
        &mut self,
        address: Address,
        instruction: Word,
        registers: &[Word; 16],
    ) -> Option<BreakHit> {
        let breakpoint = self.opcode.as_mut()?;
        if instruction & breakpoint.mask != breakpoint.value & breakpoint.mask {
            return None;
        }
        if breakpoint
            .condition
            .is_some_and(|condition| !condition.check(registers))
        {
            return None;
        }

        if breakpoint.action.hit() {
            Some(BreakHit {
                source: BreakSource::Opcode,
                address,
            })
        } else {
            info!(address, instruction, "Opcode breakpoint logged");
            None
        }
    }

    /// Check the standalone register condition, after an instruction
    pub fn check_register(&mut self, address: Address, registers: &[Word; 16]) -> Option<BreakHit> {
        let condition = self.register?;
        if !condition.check(registers) {
            return None;
        }

        if self.register_action.hit() {
            Some(BreakHit {
                source: BreakSource::Register,
                address,
            })
        } else {
            info!(address, %condition, "Register breakpoint logged");
            None
        }
    }

    /// Check a trap or interrupt delivered through `vector`
    #[must_use]
    pub fn check_trap(&self, vector: Address) -> Option<BreakHit> {
        (self.trap == Some(vector)).then_some(BreakHit {
            source: BreakSource::Trap,
            address: vector,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn no_context(_: Address) -> Option<Word> {
        None
    }

    #[test]
    fn execute_test() {
        let mut breakpoints = Breakpoints::default();
        let slot = breakpoints.add(AddressBreakpoint {
            start: 0x100,
            end: 0x10F,
            ..AddressBreakpoint::at(0)
        });
        assert_eq!(slot, Some(0));

        assert_eq!(breakpoints.check_execute(0xFF, None, false, &no_context), None);
        assert_eq!(
            breakpoints.check_execute(0x108, None, true, &no_context),
            Some(BreakHit {
                source: BreakSource::Address(0),
                address: 0x108
            })
        );
        // Not a data breakpoint
        assert_eq!(breakpoints.check_data(0x108, false, true, &no_context), None);
    }

    #[test]
    fn mapping_mode_test() {
        let mut breakpoints = Breakpoints::default();
        breakpoints.add(AddressBreakpoint {
            mode: BreakMode::UNMAPPED | BreakMode::WRITE,
            ..AddressBreakpoint::at(0x200)
        });

        assert_eq!(breakpoints.check_data(0x200, true, true, &no_context), None);
        assert_eq!(breakpoints.check_data(0x200, false, false, &no_context), None);
        assert!(breakpoints.check_data(0x200, true, false, &no_context).is_some());
    }

    #[test]
    fn transition_test() {
        let mut breakpoints = Breakpoints::default();
        breakpoints.add(AddressBreakpoint {
            start: 0x100,
            end: 0x1FF,
            mode: BreakMode::default() | BreakMode::TRANSITION,
            ..AddressBreakpoint::at(0)
        });

        assert!(breakpoints.check_execute(0x150, Some(0x80), false, &no_context).is_some());
        assert_eq!(breakpoints.check_execute(0x151, Some(0x150), false, &no_context), None);
    }

    #[test]
    fn log_and_go_test() {
        let mut breakpoints = Breakpoints::default();
        breakpoints.add(AddressBreakpoint {
            action: BreakAction::Log(2),
            ..AddressBreakpoint::at(0x40)
        });

        assert_eq!(breakpoints.check_execute(0x40, None, false, &no_context), None);
        assert_eq!(breakpoints.check_execute(0x40, None, false, &no_context), None);
        assert!(breakpoints.check_execute(0x40, None, false, &no_context).is_some());
        assert!(breakpoints.check_execute(0x40, None, false, &no_context).is_some());
    }

    #[test]
    fn context_filter_test() {
        let mut breakpoints = Breakpoints::default();
        breakpoints.add(AddressBreakpoint {
            context: Some(ContextFilter {
                address: 0x4C,
                value: 7,
            }),
            ..AddressBreakpoint::at(0x300)
        });

        assert_eq!(breakpoints.check_execute(0x300, None, false, &|_| Some(6)), None);
        let memory = |a: Address| (a == 0x4C).then_some(7);
        assert!(breakpoints.check_execute(0x300, None, false, &memory).is_some());
    }

    #[test]
    fn opcode_test() {
        let mut registers = [0; 16];
        let mut breakpoints = Breakpoints {
            opcode: Some(OpcodeBreakpoint {
                value: 0x0F00_0000,
                mask: 0x7F00_0000,
                condition: Some(RegisterCondition {
                    register: 3,
                    comparator: Comparator::Eq(5),
                }),
                action: BreakAction::Halt,
            }),
            ..Breakpoints::default()
        };

        assert_eq!(breakpoints.check_opcode(0x10, 0x8F00_0048, &registers), None);
        registers[3] = 5;
        assert!(breakpoints.check_opcode(0x10, 0x8F00_0048, &registers).is_some());
        assert_eq!(breakpoints.check_opcode(0x10, 0x3200_0048, &registers), None);
    }

    #[test]
    fn register_and_trap_test() {
        let mut registers = [0; 16];
        let mut breakpoints = Breakpoints {
            register: Some(RegisterCondition {
                register: 1,
                comparator: Comparator::Gt(10),
            }),
            trap: Some(0x40),
            ..Breakpoints::default()
        };

        assert_eq!(breakpoints.check_register(0x20, &registers), None);
        registers[1] = 11;
        assert_eq!(
            breakpoints.check_register(0x20, &registers).map(|hit| hit.source),
            Some(BreakSource::Register)
        );
        assert!(breakpoints.check_trap(0x40).is_some());
        assert!(breakpoints.check_trap(0x41).is_none());
        assert_eq!(breakpoints.register.map(|c| c.to_string()).as_deref(), Some("R1 > 0xa"));
    }

    #[test]
    fn slots_test() {
        let mut breakpoints = Breakpoints::default();
        for i in 0..ADDRESS_BREAKPOINTS {
            assert_eq!(breakpoints.add(AddressBreakpoint::at(i as Address)), Some(i));
        }
        assert_eq!(breakpoints.add(AddressBreakpoint::at(99)), None);
        assert_eq!(breakpoints.remove(2).map(|b| b.start), Some(2));
        assert_eq!(breakpoints.add(AddressBreakpoint::at(99)), Some(2));
    }
}
