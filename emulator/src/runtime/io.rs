//! The bridge between the processor and the I/O subsystem.
//!
//! The processor never emulates devices itself: SIO, TIO, TDV, HIO, AIO and
//! the non-interrupt modes of RD/WD are forwarded to an [`IoProcessor`].
//! Devices run on their own threads, read and write real memory directly and
//! report completion through the interrupt posting API.

use super::registers::ConditionCode;
use crate::constants::{Address, Word};

/// Outcome of an I/O instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoResult {
    /// CC1 and CC2 as set by the I/O processor
    pub cc: ConditionCode,

    /// Device status halfword
    pub status: u16,

    /// Remaining byte count
    pub byte_count: u16,

    /// Doubleword address of the current command
    pub command: Address,
}

impl IoResult {
    /// The I/O address is not recognized
    pub const NOT_RECOGNIZED: Self = Self {
        cc: ConditionCode::CC1.union(ConditionCode::CC2),
        status: 0,
        byte_count: 0,
        command: 0,
    };

    #[must_use]
    pub const fn accepted(status: u16, byte_count: u16) -> Self {
        Self {
            cc: ConditionCode::empty(),
            status,
            byte_count,
            command: 0,
        }
    }

    #[must_use]
    pub const fn with_command(mut self, command: Address) -> Self {
        self.command = command;
        self
    }
}

/// An I/O processor, receiving the I/O instructions of the CPU
pub trait IoProcessor: Send {
    /// Start the channel program whose first command doubleword is at the
    /// real doubleword address `command`
    fn start(&mut self, unit: u16, command: Address) -> IoResult;

    /// Report the state of the device and of its current operation
    fn test(&mut self, unit: u16) -> IoResult;

    /// Report device-specific status
    fn test_device(&mut self, unit: u16) -> IoResult;

    /// Stop the current operation
    fn halt(&mut self, unit: u16) -> IoResult;

    /// Status of a device whose interrupt is being acknowledged
    fn acknowledge(&mut self, unit: u16) -> IoResult {
        let _ = unit;
        IoResult::accepted(0, 0)
    }

    /// RD in a mode not handled by the processor
    fn read_direct(&mut self, address: u16) -> (ConditionCode, Word) {
        let _ = address;
        (ConditionCode::empty(), 0)
    }

    /// WD in a mode not handled by the processor
    fn write_direct(&mut self, address: u16, value: Word) -> ConditionCode {
        let _ = (address, value);
        ConditionCode::empty()
    }

    /// Return every device to its idle state
    fn reset(&mut self) {}
}

/// An I/O processor with nothing attached
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIo;

impl IoProcessor for NullIo {
    fn start(&mut self, _unit: u16, _command: Address) -> IoResult {
        IoResult::NOT_RECOGNIZED
    }

    fn test(&mut self, _unit: u16) -> IoResult {
        IoResult::NOT_RECOGNIZED
    }

    fn test_device(&mut self, _unit: u16) -> IoResult {
        IoResult::NOT_RECOGNIZED
    }

    fn halt(&mut self, _unit: u16) -> IoResult {
        IoResult::NOT_RECOGNIZED
    }
}
