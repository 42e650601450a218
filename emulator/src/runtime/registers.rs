use bitflags::bitflags;

use crate::constants::{self as C, Address, Doubleword, Word};

bitflags! {
    /// Condition codes, CC1 being the most significant bit
    #[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct ConditionCode: u8 {
        const CC1 = 0b1000;
        const CC2 = 0b0100;
        const CC3 = 0b0010;
        const CC4 = 0b0001;
    }
}

bitflags! {
    /// Floating-point mode controls
    #[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct FloatMode: u8 {
        /// Trap on significance loss
        const SIGNIFICANCE = 0b100;
        /// Trap on characteristic underflow
        const ZERO         = 0b010;
        /// Do not post-normalize
        const NORMALIZE    = 0b001;
    }
}

bitflags! {
    /// Processor mode bits
    #[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct Mode: u8 {
        /// Slave mode; clear means master
        const SLAVE           = 0b1000;
        /// Virtual addresses go through the memory map
        const MAPPED          = 0b0100;
        /// Decimal faults trap
        const DECIMAL_TRAP    = 0b0010;
        /// Fixed-point overflow traps
        const ARITHMETIC_TRAP = 0b0001;
    }
}

bitflags! {
    /// Interrupt inhibits
    #[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct Inhibit: u8 {
        /// Counter pulse and counter-zero levels
        const COUNTER  = 0b100;
        /// I/O and control panel levels
        const IO       = 0b010;
        /// External levels
        const EXTERNAL = 0b001;
    }
}

impl std::fmt::Debug for ConditionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04b}", self.bits())
    }
}

impl std::fmt::Debug for FloatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03b}", self.bits())
    }
}

impl std::fmt::Debug for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04b}", self.bits())
    }
}

impl std::fmt::Debug for Inhibit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03b}", self.bits())
    }
}

const MA_BIT: Word = 0x0080_0000;

/// The program status doubleword
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Psd {
    pub cc: ConditionCode,
    pub float: FloatMode,
    pub mode: Mode,

    /// Instruction address, a 17-bit word address
    pub ia: Address,

    /// Write key
    pub wk: u8,

    pub inhibit: Inhibit,

    /// Mode altered, enables extended unmapped addressing
    pub ma: bool,

    /// Address extension
    pub ext: u8,

    /// Trapped status
    pub ts: u8,

    /// Register block pointer
    pub rp: u8,
}

impl Psd {
    #[must_use]
    pub fn from_words(word0: Word, word1: Word) -> Self {
        Self {
            cc: ConditionCode::from_bits_truncate((word0 >> 28) as u8),
            float: FloatMode::from_bits_truncate((word0 >> 24) as u8 & 0x7),
            mode: Mode::from_bits_truncate((word0 >> 20) as u8 & 0xF),
            ia: word0 & C::ADDRESS_MASK,
            wk: ((word1 >> 28) & 0x3) as u8,
            inhibit: Inhibit::from_bits_truncate((word1 >> 24) as u8 & 0x7),
            ma: word1 & MA_BIT != 0,
            ext: ((word1 >> 16) & 0x3F) as u8,
            ts: ((word1 >> 8) & 0xFF) as u8,
            rp: ((word1 >> 4) & 0xF) as u8,
        }
    }

    #[must_use]
    pub fn from_doubleword(value: Doubleword) -> Self {
        Self::from_words((value >> 32) as Word, value as Word)
    }

    #[must_use]
    pub fn words(&self) -> (Word, Word) {
        let word0 = (Word::from(self.cc.bits()) << 28)
            | (Word::from(self.float.bits()) << 24)
            | (Word::from(self.mode.bits()) << 20)
            | (self.ia & C::ADDRESS_MASK);

        let word1 = (Word::from(self.wk & 0x3) << 28)
            | (Word::from(self.inhibit.bits()) << 24)
            | if self.ma { MA_BIT } else { 0 }
            | (Word::from(self.ext & 0x3F) << 16)
            | (Word::from(self.ts) << 8)
            | (Word::from(self.rp & 0xF) << 4);

        (word0, word1)
    }

    #[must_use]
    pub fn to_doubleword(&self) -> Doubleword {
        let (word0, word1) = self.words();
        (Doubleword::from(word0) << 32) | Doubleword::from(word1)
    }

    #[must_use]
    pub fn is_master(&self) -> bool {
        !self.mode.contains(Mode::SLAVE)
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mode.contains(Mode::MAPPED)
    }

    /// Set CC3/CC4 from the sign of a result, leaving CC1/CC2 alone
    pub fn set_sign(&mut self, value: i64) {
        self.cc.set(ConditionCode::CC3, value > 0);
        self.cc.set(ConditionCode::CC4, value < 0);
    }

    /// Set CC1 and CC2, leaving CC3/CC4 alone
    pub fn set_flags(&mut self, cc1: bool, cc2: bool) {
        self.cc.set(ConditionCode::CC1, cc1);
        self.cc.set(ConditionCode::CC2, cc2);
    }

    pub(crate) fn advance(&mut self) {
        self.ia = (self.ia + 1) & C::ADDRESS_MASK;
    }

    pub(crate) fn back_up(&mut self) {
        self.ia = self.ia.wrapping_sub(1) & C::ADDRESS_MASK;
    }
}

impl std::fmt::Display for Psd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (word0, word1) = self.words();
        write!(
            f,
            "{word0:08X} {word1:08X}  IA={:05X} CC={:?} FL={:?} {} {}{}{}",
            self.ia,
            self.cc,
            self.float,
            if self.is_master() { "MASTER" } else { "SLAVE" },
            if self.is_mapped() { "MAPPED" } else { "UNMAPPED" },
            if self.mode.contains(Mode::DECIMAL_TRAP) { " DM" } else { "" },
            if self.mode.contains(Mode::ARITHMETIC_TRAP) { " AM" } else { "" },
        )?;
        write!(
            f,
            " WK={} INH={:?}{} EXT={:02X} TS={:02X} RP={}",
            self.wk,
            self.inhibit,
            if self.ma { " MA" } else { "" },
            self.ext,
            self.ts,
            self.rp,
        )
    }
}

/// The sixteen blocks of sixteen general registers
#[derive(Clone, PartialEq, Eq)]
pub struct RegisterFile {
    blocks: Box<[[Word; C::REGISTERS]; C::REGISTER_BLOCKS]>,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            blocks: Box::new([[0; C::REGISTERS]; C::REGISTER_BLOCKS]),
        }
    }
}

impl std::fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RegisterFile {{ block 0: {:08X?}, ... }}", self.blocks[0])
    }
}

impl RegisterFile {
    #[must_use]
    pub fn block(&self, rp: u8) -> &[Word; C::REGISTERS] {
        &self.blocks[usize::from(rp) % C::REGISTER_BLOCKS]
    }

    pub fn block_mut(&mut self, rp: u8) -> &mut [Word; C::REGISTERS] {
        &mut self.blocks[usize::from(rp) % C::REGISTER_BLOCKS]
    }

    #[must_use]
    pub fn get(&self, rp: u8, r: u8) -> Word {
        self.block(rp)[usize::from(r) % C::REGISTERS]
    }

    pub fn set(&mut self, rp: u8, r: u8, value: Word) {
        self.block_mut(rp)[usize::from(r) % C::REGISTERS] = value;
    }

    /// Registers R and R|1 as a doubleword
    #[must_use]
    pub fn get_pair(&self, rp: u8, r: u8) -> Doubleword {
        (Doubleword::from(self.get(rp, r)) << 32) | Doubleword::from(self.get(rp, r | 1))
    }

    /// Store a doubleword in R and R|1; with an odd R only the low word remains
    pub fn set_pair(&mut self, rp: u8, r: u8, value: Doubleword) {
        self.set(rp, r, (value >> 32) as Word);
        self.set(rp, r | 1, value as Word);
    }

    pub fn clear(&mut self) {
        for block in self.blocks.iter_mut() {
            block.fill(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn psd_layout_test() {
        let psd = Psd {
            cc: ConditionCode::CC1 | ConditionCode::CC4,
            float: FloatMode::ZERO,
            mode: Mode::SLAVE | Mode::MAPPED,
            ia: 0x1_2345,
            wk: 2,
            inhibit: Inhibit::IO,
            ma: true,
            ext: 0x15,
            ts: 0xA5,
            rp: 7,
        };

        assert_eq!(psd.words(), (0x92C1_2345, 0x2295_A570));
        assert_eq!(Psd::from_doubleword(psd.to_doubleword()), psd);
        assert!(!psd.is_master());
        assert!(psd.is_mapped());
    }

    #[test]
    fn psd_round_trip_test() {
        for cc in 0..16 {
            for rp in 0..16 {
                for inhibit in 0..8 {
                    let psd = Psd {
                        cc: ConditionCode::from_bits_truncate(cc),
                        float: FloatMode::from_bits_truncate(cc >> 1),
                        mode: Mode::from_bits_truncate(rp),
                        ia: (u32::from(cc) << 13) | u32::from(rp),
                        wk: inhibit & 3,
                        inhibit: Inhibit::from_bits_truncate(inhibit),
                        ma: rp & 1 == 1,
                        ext: rp * 4,
                        ts: cc * 16 + rp,
                        rp,
                    };
                    assert_eq!(Psd::from_doubleword(psd.to_doubleword()), psd);
                }
            }
        }
    }

    #[test]
    fn ignores_reserved_bits_test() {
        // Bits 4, 12–14, 32–33, 36, 41 and 60–63 are not stored
        let psd = Psd::from_words(0x080E_0000, 0xC840_000F);
        assert_eq!(psd, Psd::default());
    }

    #[test]
    fn condition_code_test() {
        let mut psd = Psd::default();
        psd.set_flags(true, false);
        psd.set_sign(-3);
        assert_eq!(psd.cc, ConditionCode::CC1 | ConditionCode::CC4);
        psd.set_sign(0);
        assert_eq!(psd.cc, ConditionCode::CC1);
    }

    #[test]
    fn register_blocks_test() {
        let mut registers = RegisterFile::default();
        registers.set(0, 3, 0x1234);
        registers.set(5, 3, 0x5678);
        assert_eq!(registers.get(0, 3), 0x1234);
        assert_eq!(registers.get(5, 3), 0x5678);

        registers.set_pair(2, 6, 0x1111_2222_3333_4444);
        assert_eq!(registers.get(2, 6), 0x1111_2222);
        assert_eq!(registers.get(2, 7), 0x3333_4444);
        assert_eq!(registers.get_pair(2, 6), 0x1111_2222_3333_4444);

        registers.set_pair(2, 7, 0xAAAA_AAAA_BBBB_BBBB);
        assert_eq!(registers.get(2, 7), 0xBBBB_BBBB);
    }
}
