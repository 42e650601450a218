use std::time::Duration;

use crate::codec::Feature;
use crate::constants as C;

/// Construction parameters of a machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// Installed real memory, in 512-word pages
    pub memory_pages: usize,

    /// Device address the bootstrap reads from
    pub boot_device: u16,

    /// Interval between real-time clock pulses
    pub clock_tick: Duration,

    /// Counters whose pulses the clock thread generates
    pub counters: [bool; C::COUNTERS],

    /// Bound on a WAIT (or idle loop) before the processor polls again
    pub wait_poll: Duration,

    /// Instructions executed per acquisition of the control lock
    pub batch_size: usize,

    /// Park the processor on a BCR or BCS to itself until an interrupt arrives
    pub idle_detection: bool,

    /// Record per-opcode execution time
    pub profile: bool,

    /// Optional instruction groups installed. Instructions of a missing
    /// group take the unimplemented-instruction trap.
    pub floating_point: bool,
    pub decimal: bool,

    /// Bound on acquiring the control lock for a status snapshot
    pub status_timeout: Duration,

    /// Bound on acquiring the control lock at power off
    pub power_off_timeout: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_pages: C::DEFAULT_PAGES,
            boot_device: 0x080,
            clock_tick: Duration::from_millis(2),
            counters: [true, true, false, false],
            wait_poll: Duration::from_millis(10),
            batch_size: 1000,
            idle_detection: true,
            profile: false,
            floating_point: true,
            decimal: true,
            status_timeout: Duration::from_secs(1),
            power_off_timeout: Duration::from_secs(2),
        }
    }
}

impl MachineConfig {
    #[must_use]
    pub fn with_memory_pages(mut self, pages: usize) -> Self {
        self.memory_pages = pages.clamp(1, C::MAX_PAGES);
        self
    }

    #[must_use]
    pub fn with_boot_device(mut self, device: u16) -> Self {
        self.boot_device = device;
        self
    }

    #[must_use]
    pub fn with_clock_tick(mut self, tick: Duration) -> Self {
        self.clock_tick = tick;
        self
    }

    /// Remove an optional instruction group
    #[must_use]
    pub fn without(mut self, feature: Feature) -> Self {
        match feature {
            Feature::Floating => self.floating_point = false,
            Feature::Decimal => self.decimal = false,
        }
        self
    }

    #[must_use]
    pub const fn installs(&self, feature: Feature) -> bool {
        match feature {
            Feature::Floating => self.floating_point,
            Feature::Decimal => self.decimal,
        }
    }
}
