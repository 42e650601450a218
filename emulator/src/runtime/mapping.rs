//! Virtual to real address translation.
//!
//! The 17-bit virtual word address space is split in 256 pages of 512
//! words. Each page has a map entry (the real page number) and a 2-bit
//! access code, both programmed by MMC. Translation applies only while the
//! PSD mapping bit is set; unmapped references are real, optionally
//! extended by the PSD address extension.

use parse_display::Display;

use super::exception::Trap;
use super::registers::Psd;
use crate::constants::{self as C, Address, Word};

/// A page access code, and the kind of a reference checked against it.
///
/// The order is meaningful: a code permits every reference that is not
/// less than it. `Read` pages also allow instruction fetches, `Execute`
/// pages allow nothing else.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[display(style = "lowercase")]
pub enum Access {
    #[default]
    Write = 0,
    Read = 1,
    Execute = 2,
    None = 3,
}

impl Access {
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::Write,
            1 => Self::Read,
            2 => Self::Execute,
            _ => Self::None,
        }
    }

    /// Whether a page with this code allows a reference of kind `request`
    #[must_use]
    pub fn permits(self, request: Access) -> bool {
        self <= request
    }
}

/// The memory map and access-protection tables
#[derive(Clone, PartialEq, Eq)]
pub struct VirtualMemory {
    map: [u16; C::VIRTUAL_PAGES],
    access: [Access; C::VIRTUAL_PAGES],
}

impl Default for VirtualMemory {
    fn default() -> Self {
        Self {
            map: [0; C::VIRTUAL_PAGES],
            access: [Access::Write; C::VIRTUAL_PAGES],
        }
    }
}

impl std::fmt::Debug for VirtualMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VirtualMemory {{ map: [{:#x}, ...] }}", self.map[0])
    }
}

const fn page_of(address: Address) -> usize {
    ((address & C::ADDRESS_MASK) / C::PAGE_WORDS) as usize
}

impl VirtualMemory {
    /// The real word address a virtual word address maps to, without any check
    #[must_use]
    pub fn map_word(&self, address: Address) -> Address {
        let page = Address::from(self.map[page_of(address)]);
        page * C::PAGE_WORDS + (address % C::PAGE_WORDS)
    }

    /// Map entry and access code of a virtual page
    #[must_use]
    pub fn entry(&self, page: usize) -> (u16, Access) {
        let page = page % C::VIRTUAL_PAGES;
        (self.map[page], self.access[page])
    }

    /// Translate a word address for a reference of kind `request`, under `psd`.
    ///
    /// Access codes are only enforced in slave mode. The result is always
    /// checked against the installed memory size, in words.
    ///
    /// # Errors
    ///
    /// Returns a protection trap on an access-code violation, and a
    /// nonexistent-address trap past the end of installed memory.
    pub fn real_address(
        &self,
        psd: &Psd,
        address: Address,
        request: Access,
        installed_words: usize,
    ) -> Result<Address, Trap> {
        let address = address & C::ADDRESS_MASK;

        let real = if psd.is_mapped() {
            if !psd.is_master() && !self.access[page_of(address)].permits(request) {
                return Err(Trap::Protection(address));
            }
            self.map_word(address)
        } else if psd.ma && address & 0x1_0000 != 0 {
            (Address::from(psd.ext) << 16) | (address & 0xFFFF)
        } else {
            address
        };

        if (real as usize) < installed_words {
            Ok(real)
        } else {
            Err(Trap::NonexistentAddress(address))
        }
    }

    /// Load four 8-bit map entries from one word, most significant first.
    /// Returns the page following the last one set.
    pub fn set_map(&mut self, first_page: usize, word: Word) -> usize {
        for i in 0..4 {
            let entry = (word >> (24 - 8 * i)) & 0xFF;
            self.map[(first_page + i) % C::VIRTUAL_PAGES] = entry as u16;
        }
        (first_page + 4) % C::VIRTUAL_PAGES
    }

    /// Load two 13-bit map entries from the halfwords of one word.
    /// Returns the page following the last one set.
    pub fn set_map_wide(&mut self, first_page: usize, word: Word) -> usize {
        for i in 0..2 {
            let entry = (word >> (16 - 16 * i)) & 0x1FFF;
            self.map[(first_page + i) % C::VIRTUAL_PAGES] = entry as u16;
        }
        (first_page + 2) % C::VIRTUAL_PAGES
    }

    /// Load sixteen 2-bit access codes from one word, most significant first.
    /// Returns the page following the last one set.
    pub fn set_access(&mut self, first_page: usize, word: Word) -> usize {
        for i in 0..16 {
            let bits = (word >> (30 - 2 * i)) & 0x3;
            self.access[(first_page + i) % C::VIRTUAL_PAGES] = Access::from_bits(bits as u8);
        }
        (first_page + 16) % C::VIRTUAL_PAGES
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::runtime::registers::Mode;

    fn slave_mapped() -> Psd {
        Psd {
            mode: Mode::SLAVE | Mode::MAPPED,
            ..Psd::default()
        }
    }

    #[test]
    fn access_order_test() {
        assert!(Access::Write.permits(Access::Write));
        assert!(Access::Write.permits(Access::Read));
        assert!(Access::Write.permits(Access::Execute));
        assert!(Access::Read.permits(Access::Read));
        assert!(Access::Read.permits(Access::Execute));
        assert!(!Access::Read.permits(Access::Write));
        assert!(Access::Execute.permits(Access::Execute));
        assert!(!Access::Execute.permits(Access::Read));
        assert!(!Access::Execute.permits(Access::Write));
        assert!(!Access::None.permits(Access::Execute));
    }

    #[test]
    fn mapped_translation_test() {
        let mut vm = VirtualMemory::default();
        assert_eq!(vm.set_map(4, 0x0102_0A0B), 8);
        assert_eq!(vm.map_word(4 * 512 + 3), 512 + 3);
        assert_eq!(vm.map_word(7 * 512 + 0x1FF), 0x0B * 512 + 0x1FF);

        let psd = slave_mapped();
        assert_eq!(vm.real_address(&psd, 5 * 512 + 1, Access::Read, 0x2000), Ok(2 * 512 + 1));
        assert_eq!(
            vm.real_address(&psd, 7 * 512, Access::Read, 0x1000),
            Err(Trap::NonexistentAddress(7 * 512))
        );
    }

    #[test]
    fn wide_map_test() {
        let mut vm = VirtualMemory::default();
        vm.set_map_wide(255, 0x1FFF_0123);
        assert_eq!(vm.entry(255).0, 0x1FFF);
        assert_eq!(vm.entry(0).0, 0x0123);
    }

    #[test]
    fn protection_test() {
        let mut vm = VirtualMemory::default();
        // Pages 0–3: write, read, execute, none
        vm.set_access(0, 0x1B00_0000);
        assert_eq!(vm.entry(1).1, Access::Read);
        assert_eq!(vm.entry(2).1, Access::Execute);
        assert_eq!(vm.entry(3).1, Access::None);

        let psd = slave_mapped();
        let page = |n: Address| n * 512 + 0x10;
        assert!(vm.real_address(&psd, page(0), Access::Write, 0x20000).is_ok());
        assert!(vm.real_address(&psd, page(1), Access::Read, 0x20000).is_ok());
        assert!(vm.real_address(&psd, page(1), Access::Execute, 0x20000).is_ok());
        assert_eq!(
            vm.real_address(&psd, page(1), Access::Write, 0x20000),
            Err(Trap::Protection(page(1)))
        );
        assert_eq!(
            vm.real_address(&psd, page(3), Access::Read, 0x20000),
            Err(Trap::Protection(page(3)))
        );

        // Master mode ignores access codes
        let master = Psd {
            mode: Mode::MAPPED,
            ..Psd::default()
        };
        assert!(vm.real_address(&master, page(3), Access::Write, 0x20000).is_ok());
    }

    #[test]
    fn execute_only_test() {
        let mut vm = VirtualMemory::default();
        vm.set_access(0, 0x2000_0000);
        assert_eq!(vm.entry(0).1, Access::Execute);

        let slave = slave_mapped();
        assert!(vm.real_address(&slave, 0x10, Access::Execute, 0x20000).is_ok());
        assert_eq!(
            vm.real_address(&slave, 0x10, Access::Read, 0x20000),
            Err(Trap::Protection(0x10))
        );
        assert_eq!(
            vm.real_address(&slave, 0x10, Access::Write, 0x20000),
            Err(Trap::Protection(0x10))
        );

        let master = Psd {
            mode: Mode::MAPPED,
            ..Psd::default()
        };
        assert!(vm.real_address(&master, 0x10, Access::Read, 0x20000).is_ok());

        // An equal or looser code allows the same read
        vm.set_access(0, 0x4000_0000);
        assert!(vm.real_address(&slave, 0x10, Access::Read, 0x20000).is_ok());
        vm.set_access(0, 0);
        assert!(vm.real_address(&slave, 0x10, Access::Read, 0x20000).is_ok());
    }

    #[test]
    fn unmapped_test() {
        let vm = VirtualMemory::default();
        let psd = Psd::default();
        assert_eq!(vm.real_address(&psd, 0x1_2345, Access::Read, 0x20000), Ok(0x1_2345));
        assert_eq!(
            vm.real_address(&psd, 0x1_2345, Access::Read, 0x10000),
            Err(Trap::NonexistentAddress(0x1_2345))
        );

        let extended = Psd {
            ma: true,
            ext: 5,
            ..Psd::default()
        };
        assert_eq!(vm.real_address(&extended, 0x1_2345, Access::Read, 0x80000), Ok(0x5_2345));
        assert_eq!(vm.real_address(&extended, 0x0_2345, Access::Read, 0x80000), Ok(0x2345));
    }
}
