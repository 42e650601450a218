//! Push-down stack instructions.
//!
//! A stack is described by a stack pointer doubleword in memory:
//!
//! ```text
//! word 0   bits 15–31   top-of-stack word address
//! word 1   bit 0        TS, inhibit the space limit trap
//!          bits 1–15    space count
//!          bit 16       TW, inhibit the word limit trap
//!          bits 17–31   word count
//! ```
//!
//! Every operation checks both limits before touching anything, so a
//! trapped or inhibited operation leaves the stack and registers unchanged.
//! PSM also checks every slot it is about to store into.

use tracing::trace;

use super::{Computer, ConditionCode, Trap};
use crate::constants::{self as C, Address, Doubleword, Word};

const COUNT_LIMIT: i64 = 0x7FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StackPointer {
    top: Address,
    space: i64,
    words: i64,
    inhibit_space: bool,
    inhibit_words: bool,
}

impl StackPointer {
    fn from_doubleword(value: Doubleword) -> Self {
        let word0 = (value >> 32) as Word;
        let word1 = value as Word;
        Self {
            top: word0 & C::ADDRESS_MASK,
            space: i64::from((word1 >> 16) & 0x7FFF),
            words: i64::from(word1 & 0x7FFF),
            inhibit_space: word1 & 0x8000_0000 != 0,
            inhibit_words: word1 & 0x8000 != 0,
        }
    }

    /// The updated doubleword, keeping the bits of word 0 outside the address
    fn to_doubleword(self, original: Doubleword) -> Doubleword {
        let word0 = ((original >> 32) as Word & !C::ADDRESS_MASK) | (self.top & C::ADDRESS_MASK);
        let word1 = (Word::from(self.inhibit_space) << 31)
            | ((self.space as Word & 0x7FFF) << 16)
            | (Word::from(self.inhibit_words) << 15)
            | (self.words as Word & 0x7FFF);
        (Doubleword::from(word0) << 32) | Doubleword::from(word1)
    }

    /// Check that `delta` words can be pushed (or pulled, when negative)
    fn check(&self, delta: i64) -> Result<(), Limit> {
        let space = self.space - delta;
        let words = self.words + delta;
        let space_fault = !(0..=COUNT_LIMIT).contains(&space);
        let words_fault = !(0..=COUNT_LIMIT).contains(&words);

        match (space_fault, words_fault) {
            (false, false) => Ok(()),
            (true, _) if !self.inhibit_space => Err(Limit::Trap(Trap::StackLimit {
                space: true,
                words: words_fault && !self.inhibit_words,
            })),
            (_, true) if !self.inhibit_words => Err(Limit::Trap(Trap::StackLimit {
                space: false,
                words: true,
            })),
            _ => Err(Limit::Inhibited {
                space: space_fault,
                words: words_fault,
            }),
        }
    }

    fn adjust(&mut self, delta: i64) {
        self.top = (self.top as i64 + delta) as Address & C::ADDRESS_MASK;
        self.space -= delta;
        self.words += delta;
    }
}

enum Limit {
    Trap(Trap),
    Inhibited { space: bool, words: bool },
}

impl Computer {
    /// Read the stack pointer and check the limits for moving `delta` words.
    /// `None` means the limit was inhibited and the instruction is done.
    fn stack_pointer(
        &mut self,
        ea: Address,
        delta: i64,
    ) -> Result<Option<(StackPointer, Doubleword)>, Trap> {
        let original = self.read_doubleword(ea)?;
        let pointer = StackPointer::from_doubleword(original);

        match pointer.check(delta) {
            Ok(()) => Ok(Some((pointer, original))),
            Err(Limit::Trap(trap)) => Err(trap),
            Err(Limit::Inhibited { space, words }) => {
                self.psd.cc.set(ConditionCode::CC1, space);
                self.psd.cc.set(ConditionCode::CC3, words);
                trace!(space, words, "Stack limit inhibited");
                Ok(None)
            }
        }
    }

    fn finish_stack(
        &mut self,
        ea: Address,
        pointer: StackPointer,
        original: Doubleword,
    ) -> Result<(), Trap> {
        self.write_doubleword(ea, pointer.to_doubleword(original))?;
        self.psd.cc.set(ConditionCode::CC1, false);
        self.psd.cc.set(ConditionCode::CC3, false);
        self.psd.cc.set(ConditionCode::CC2, pointer.space == 0);
        self.psd.cc.set(ConditionCode::CC4, pointer.words == 0);
        Ok(())
    }

    pub(super) fn push_word(&mut self, r: u8, ea: Address) -> Result<(), Trap> {
        let Some((mut pointer, original)) = self.stack_pointer(ea, 1)? else {
            return Ok(());
        };

        let word = self.reg(r);
        let top = (pointer.top + 1) & C::ADDRESS_MASK;
        self.write_word(top * C::WORD_BYTES, word)?;
        pointer.adjust(1);
        self.finish_stack(ea, pointer, original)
    }

    pub(super) fn pull_word(&mut self, r: u8, ea: Address) -> Result<(), Trap> {
        let Some((mut pointer, original)) = self.stack_pointer(ea, -1)? else {
            return Ok(());
        };

        let word = self.read_word(pointer.top * C::WORD_BYTES)?;
        pointer.adjust(-1);
        self.finish_stack(ea, pointer, original)?;
        self.set_reg(r, word);
        Ok(())
    }

    /// Push CC registers (16 for a zero CC) starting at R
    pub(super) fn push_multiple(&mut self, r: u8, ea: Address) -> Result<(), Trap> {
        let count = match self.psd.cc.bits() {
            0 => 16,
            n => n,
        };
        let Some((mut pointer, original)) = self.stack_pointer(ea, i64::from(count))? else {
            return Ok(());
        };

        let slot = |i: u8| ((pointer.top + 1 + Address::from(i)) & C::ADDRESS_MASK) * C::WORD_BYTES;
        for i in 0..count {
            self.check_write_word(slot(i))?;
        }
        for i in 0..count {
            let word = self.reg((r + i) & 0xF);
            self.write_word(slot(i), word)?;
        }
        pointer.adjust(i64::from(count));
        self.finish_stack(ea, pointer, original)
    }

    /// Pull CC words into the registers starting at R, the top of the stack
    /// landing in the last one
    pub(super) fn pull_multiple(&mut self, r: u8, ea: Address) -> Result<(), Trap> {
        let count = match self.psd.cc.bits() {
            0 => 16,
            n => n,
        };
        let Some((mut pointer, original)) = self.stack_pointer(ea, -i64::from(count))? else {
            return Ok(());
        };

        let first = pointer.top.wrapping_sub(Address::from(count) - 1) & C::ADDRESS_MASK;
        let mut words = Vec::with_capacity(usize::from(count));
        for i in 0..count {
            let address = (first + Address::from(i)) & C::ADDRESS_MASK;
            words.push(self.read_word(address * C::WORD_BYTES)?);
        }
        pointer.adjust(-i64::from(count));
        self.finish_stack(ea, pointer, original)?;
        for (i, word) in (0..count).zip(words) {
            self.set_reg((r + i) & 0xF, word);
        }
        Ok(())
    }

    /// Move the top of the stack by the signed halfword in R bits 16–31
    pub(super) fn modify_stack_pointer(&mut self, r: u8, ea: Address) -> Result<(), Trap> {
        let delta = i64::from(self.reg(r) as u16 as i16);
        let Some((mut pointer, original)) = self.stack_pointer(ea, delta)? else {
            return Ok(());
        };

        pointer.adjust(delta);
        self.finish_stack(ea, pointer, original)
    }
}
