//! Byte-string and conversion instructions.
//!
//! Byte-string instructions take the source (or table) base from R, plus the
//! signed displacement of the instruction, and describe the destination
//! string in R|1: count in bits 0–7, byte address in bits 12–31. Registers are
//! updated after every byte so an interrupted or trapped instruction can be
//! restarted.

use tracing::trace;

use super::instructions::{ordering, signed};
use super::{Computer, ConditionCode, Trap};
use crate::constants::{Address, Word};

const BYTE_MASK: Address = 0x7_FFFF;

/// Zone of an EBCDIC digit
const DIGIT_ZONE: u8 = 0xF0;

/// Edit pattern characters
const DIGIT_SELECT: u8 = 0x20;
const SIGNIFICANCE_START: u8 = 0x21;
const FIELD_SEPARATOR: u8 = 0x22;
const IMMEDIATE_SIGNIFICANCE: u8 = 0x23;

/// The destination string described by R|1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Destination {
    count: u32,
    address: Address,
}

impl Destination {
    fn from_word(word: Word) -> Self {
        Self {
            count: word >> 24,
            address: word & BYTE_MASK,
        }
    }

    fn to_word(self) -> Word {
        (self.count << 24) | (self.address & BYTE_MASK)
    }

    fn advance(&mut self) {
        self.count -= 1;
        self.address = (self.address + 1) & BYTE_MASK;
    }
}

impl Computer {
    fn source_base(&self, r: u8, displacement: i32) -> Address {
        let base = if r == 0 { 0 } else { self.reg(r) & BYTE_MASK };
        base.wrapping_add(displacement as Address) & BYTE_MASK
    }

    fn destination(&self, r: u8) -> Destination {
        Destination::from_word(self.reg(r | 1))
    }

    fn set_destination(&mut self, r: u8, destination: Destination) {
        self.set_reg(r | 1, destination.to_word());
    }

    /// Step the source base in R, unless R is register 0
    fn advance_source(&mut self, r: u8) {
        if r != 0 {
            let register = self.reg(r);
            let next = ((register & BYTE_MASK) + 1) & BYTE_MASK;
            self.set_reg(r, (register & !BYTE_MASK) | next);
        }
    }

    /// MBS: copy bytes left to right. With R = 0 the source address stays
    /// put, which propagates one byte through the destination.
    pub(super) fn move_string(&mut self, r: u8, displacement: i32) -> Result<(), Trap> {
        let mut destination = self.destination(r);
        trace!(?destination, "Moving byte string");
        while destination.count > 0 {
            let byte = self.read_byte(self.source_base(r, displacement))?;
            self.write_byte(destination.address, byte)?;
            destination.advance();
            self.advance_source(r);
            self.set_destination(r, destination);
        }
        Ok(())
    }

    /// CBS: stop at the first differing byte, CC3/CC4 telling which string is greater
    pub(super) fn compare_strings(&mut self, r: u8, displacement: i32) -> Result<(), Trap> {
        let mut destination = self.destination(r);
        self.psd.set_sign(0);
        while destination.count > 0 {
            let source = self.read_byte(self.source_base(r, displacement))?;
            let target = self.read_byte(destination.address)?;
            if source != target {
                self.psd.set_sign(ordering(source, target));
                return Ok(());
            }
            destination.advance();
            self.advance_source(r);
            self.set_destination(r, destination);
        }
        Ok(())
    }

    /// TBS: replace every destination byte by its entry in the table at R
    pub(super) fn translate_string(&mut self, r: u8, displacement: i32) -> Result<(), Trap> {
        let table = self.source_base(r, displacement);
        let mut destination = self.destination(r);
        while destination.count > 0 {
            let byte = self.read_byte(destination.address)?;
            let translated = self.read_byte((table + Address::from(byte)) & BYTE_MASK)?;
            self.write_byte(destination.address, translated)?;
            destination.advance();
            self.set_destination(r, destination);
        }
        Ok(())
    }

    /// TTBS: find the first destination byte whose table entry shares a bit
    /// with the mask in R bits 0–7. The masked entry replaces the mask and
    /// CC4 is set.
    pub(super) fn translate_and_test(&mut self, r: u8, displacement: i32) -> Result<(), Trap> {
        let mask = (self.reg(r) >> 24) as u8;
        let table = self.source_base(r, displacement);
        let mut destination = self.destination(r);

        self.psd.cc.set(ConditionCode::CC4, false);
        while destination.count > 0 {
            let byte = self.read_byte(destination.address)?;
            let entry = self.read_byte((table + Address::from(byte)) & BYTE_MASK)?;
            if entry & mask != 0 {
                let register = self.reg(r) & 0x00FF_FFFF;
                self.set_reg(r, register | (Word::from(entry & mask) << 24));
                self.psd.cc.set(ConditionCode::CC4, true);
                return Ok(());
            }
            destination.advance();
            self.set_destination(r, destination);
        }
        Ok(())
    }

    /// EBS: edit the packed decimal number at the source through the pattern
    /// in the destination. The first pattern byte is the fill character.
    pub(super) fn edit_string(&mut self, r: u8, displacement: i32) -> Result<(), Trap> {
        let mut destination = self.destination(r);
        if destination.count == 0 {
            return Ok(());
        }

        let fill = self.read_byte(destination.address)?;
        let mut significance = false;
        let mut nonzero = false;
        let mut negative = false;
        let mut low_nibble = false;

        while destination.count > 0 {
            let pattern = self.read_byte(destination.address)?;
            let output = match pattern {
                DIGIT_SELECT | SIGNIFICANCE_START | IMMEDIATE_SIGNIFICANCE => {
                    if pattern == IMMEDIATE_SIGNIFICANCE {
                        significance = true;
                    }

                    let source = self.read_byte(self.source_base(r, displacement))?;
                    let digit = if low_nibble { source & 0xF } else { source >> 4 };
                    if digit > 9 {
                        return self.decimal_fault(ConditionCode::CC1);
                    }

                    let output = if digit != 0 || significance {
                        significance = true;
                        DIGIT_ZONE | digit
                    } else {
                        fill
                    };
                    nonzero |= digit != 0;
                    if pattern == SIGNIFICANCE_START {
                        significance = true;
                    }

                    if low_nibble {
                        low_nibble = false;
                        self.advance_source(r);
                    } else if source & 0xF > 9 {
                        // A sign ends the number
                        negative = matches!(source & 0xF, 0xB | 0xD);
                        if !negative {
                            significance = false;
                        }
                        self.advance_source(r);
                    } else {
                        low_nibble = true;
                    }
                    output
                }
                FIELD_SEPARATOR => {
                    significance = false;
                    nonzero = false;
                    fill
                }
                other if significance => other,
                _ => fill,
            };

            self.write_byte(destination.address, output)?;
            destination.advance();
            self.set_destination(r, destination);
        }

        self.psd.set_flags(false, false);
        self.psd.set_sign(match (nonzero, negative) {
            (false, _) => 0,
            (true, false) => 1,
            (true, true) => -1,
        });
        Ok(())
    }

    fn conversion_table(&mut self, ea: Address) -> Result<[Word; 32], Trap> {
        let mut table = [0; 32];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = self.read_word(ea + i as Address * 4)?;
        }
        Ok(table)
    }

    /// CVA: R = the sum of the table entries selected by the bits of R|1
    pub(super) fn convert_by_addition(&mut self, r: u8, ea: Address) -> Result<(), Trap> {
        let table = self.conversion_table(ea)?;
        let selector = self.reg(r | 1);

        let mut sum: Word = 0;
        let mut carry = false;
        for (i, entry) in table.iter().enumerate() {
            if selector & (0x8000_0000 >> i) != 0 {
                let (next, overflowed) = sum.overflowing_add(*entry);
                sum = next;
                carry |= overflowed;
            }
        }

        self.set_reg(r, sum);
        self.psd.cc.set(ConditionCode::CC1, carry);
        self.psd.set_sign(signed(u64::from(sum), 32));
        Ok(())
    }

    /// CVS: subtract table entries from R while they fit, recording each one
    /// taken as a bit of R|1. R keeps the remainder.
    pub(super) fn convert_by_subtraction(&mut self, r: u8, ea: Address) -> Result<(), Trap> {
        let table = self.conversion_table(ea)?;
        let mut remainder = self.reg(r);

        let mut bits: Word = 0;
        for (i, entry) in table.iter().enumerate() {
            if remainder >= *entry {
                remainder -= entry;
                bits |= 0x8000_0000 >> i;
            }
        }

        self.set_reg(r, remainder);
        self.set_reg(r | 1, bits);
        self.psd.cc.set(ConditionCode::CC1, false);
        self.psd.set_sign(signed(u64::from(bits), 32));
        Ok(())
    }
}
