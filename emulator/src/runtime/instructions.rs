use std::cmp::Ordering;

use tracing::{debug, trace};

use super::{Access, Computer, ConditionCode, FloatMode, IoResult, Mode, Psd, Trap};
use crate::codec::{Instruction, Opcode, OperandClass};
use crate::constants::{self as C, Address, Doubleword, Word};

/// Sum of two `bits`-wide two's-complement numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Sum {
    pub result: u64,
    pub carry: bool,
    pub overflow: bool,
}

/// `a + b + carry_in`, `bits` being at most 64
pub(super) fn add_wide(a: u64, b: u64, carry_in: bool, bits: u32) -> Sum {
    let mask = if bits == 64 { u64::MAX } else { (1 << bits) - 1 };
    let sign = 1u64 << (bits - 1);
    let (a, b) = (a & mask, b & mask);
    let sum = u128::from(a) + u128::from(b) + u128::from(carry_in);
    let result = (sum as u64) & mask;

    Sum {
        result,
        carry: sum > u128::from(mask),
        overflow: (a & sign) == (b & sign) && (result & sign) != (a & sign),
    }
}

/// `a - b` as `a + !b + 1`; the carry is set when no borrow occurs
pub(super) fn subtract_wide(a: u64, b: u64, bits: u32) -> Sum {
    add_wide(a, !b, true, bits)
}

/// Sign-extend the low `bits` of `value`
pub(super) const fn signed(value: u64, bits: u32) -> i64 {
    ((value << (64 - bits)) as i64) >> (64 - bits)
}

const fn word_sign(value: Word) -> i64 {
    value as i32 as i64
}

/// 1, 0 or -1 as `a` is greater, equal or less than `b`
pub(super) fn ordering<T: Ord>(a: T, b: T) -> i64 {
    match a.cmp(&b) {
        Ordering::Greater => 1,
        Ordering::Equal => 0,
        Ordering::Less => -1,
    }
}

/// Number of registers moved by LM and STM, from the condition code
fn multiple_count(cc: ConditionCode) -> u8 {
    match cc.bits() {
        0 => 16,
        n => n,
    }
}

impl Computer {
    /// Set CC1 (carry), CC2 (overflow) and CC3/CC4 from a sum
    fn sum_cc(&mut self, sum: Sum, bits: u32) -> Result<(), Trap> {
        self.psd.set_flags(sum.carry, sum.overflow);
        self.psd.set_sign(signed(sum.result, bits));
        self.overflow_trap(sum.overflow)
    }

    /// Fixed-point overflow traps only with AM set
    pub(super) fn overflow_trap(&self, overflow: bool) -> Result<(), Trap> {
        if overflow && self.psd.mode.contains(Mode::ARITHMETIC_TRAP) {
            Err(Trap::FixedOverflow)
        } else {
            Ok(())
        }
    }

    /// CC2 from the AND of both operands, CC3/CC4 from their order
    fn compare_cc(&mut self, register: i64, operand: i64, selective: Option<Word>) {
        if let Some(and) = selective {
            self.psd.cc.set(ConditionCode::CC2, and != 0);
        }
        self.psd.set_sign(ordering(register, operand));
    }

    fn load_cc(&mut self, r: u8, value: Word) {
        self.set_reg(r, value);
        self.psd.set_sign(word_sign(value));
    }

    /// CC2 flags negating the most negative value
    fn complement_cc(&mut self, overflow: bool, result: i64) -> Result<(), Trap> {
        self.psd.cc.set(ConditionCode::CC2, overflow);
        self.psd.set_sign(result);
        self.overflow_trap(overflow)
    }

    fn branch(&mut self, ea: Address) {
        let target = (ea / C::WORD_BYTES) & C::ADDRESS_MASK;
        trace!(from = self.psd.ia, to = target, "Branching");
        self.psd.ia = target;
    }

    /// Multiply R|1 by `operand`, into R,R|1 for an even R or R alone otherwise
    fn multiply(&mut self, r: u8, operand: i64) {
        let product = word_sign(self.reg(r | 1)) * operand;
        if r & 1 == 0 {
            self.set_reg_pair(r, product as Doubleword);
        } else {
            self.set_reg(r, product as Word);
        }
        let fits = i32::try_from(product).is_ok();
        self.psd.cc.set(ConditionCode::CC2, !fits);
        self.psd.set_sign(product.signum());
        trace!(product, "Multiplied");
    }

    /// Divide R,R|1 (even R) or R (odd R) by a word
    fn divide_word(&mut self, r: u8, divisor: i64) -> Result<(), Trap> {
        let dividend = if r & 1 == 0 {
            self.reg_pair(r) as i64
        } else {
            word_sign(self.reg(r))
        };

        let quotient = dividend
            .checked_div(divisor)
            .filter(|quotient| i32::try_from(*quotient).is_ok());
        let Some(quotient) = quotient else {
            self.psd.cc.set(ConditionCode::CC2, true);
            return self.overflow_trap(true);
        };

        let remainder = dividend % divisor;
        if r & 1 == 0 {
            self.set_reg(r, remainder as Word);
            self.set_reg(r | 1, quotient as Word);
        } else {
            self.set_reg(r, quotient as Word);
        }
        self.psd.cc.set(ConditionCode::CC2, false);
        self.psd.set_sign(quotient.signum());
        Ok(())
    }

    /// Signed compare of R against two limits
    fn limits_cc(&mut self, r: u8, first: Word, second: Word) {
        let value = word_sign(self.reg(r));
        let first = ordering(value, word_sign(first));
        let second = ordering(value, word_sign(second));
        self.psd.set_flags(first > 0, first < 0);
        self.psd.set_sign(second);
    }

    fn shift(&mut self, r: u8, ea: Address) {
        let kind = (ea >> 8) & 7;
        let count = signed(u64::from(ea & 0x7F), 7);
        let double = kind & 1 == 1;
        let bits: u32 = if double { 64 } else { 32 };
        let mask = if double { u64::MAX } else { u64::from(Word::MAX) };
        let sign = 1u64 << (bits - 1);

        let mut value = if double {
            self.reg_pair(r)
        } else {
            u64::from(self.reg(r))
        };
        let mut last = false;
        let mut overflow = false;
        let mut remaining = count.unsigned_abs();

        while remaining > 0 {
            if count > 0 {
                if kind >= 6 && value & sign != 0 {
                    break;
                }
                let out = value & sign != 0;
                value = (value << 1) & mask;
                match kind {
                    2 | 3 | 6 | 7 => value |= u64::from(out),
                    4 | 5 => overflow |= (value & sign != 0) != out,
                    _ => {}
                }
                last = out;
            } else {
                let out = value & 1 != 0;
                let top = value & sign;
                value >>= 1;
                match kind {
                    2 | 3 | 6 | 7 => value |= u64::from(out) << (bits - 1),
                    4 | 5 => value |= top,
                    _ => {}
                }
                last = out;
            }
            remaining -= 1;
        }

        if kind >= 6 {
            // Searching shifts leave the unused count in register 1, CC1 is
            // set when a one reached bit 0
            self.set_reg(1, remaining as Word);
            last = value & sign != 0;
        }

        if double {
            self.set_reg_pair(r, value);
        } else {
            self.set_reg(r, value as Word);
        }
        self.psd.set_flags(last, overflow);
        self.psd.set_sign(signed(value, bits));
        trace!(kind, count, result = value, "Shifted");
    }

    /// Load the condition code and floating controls from a byte
    fn load_controls(&mut self, r: u8, byte: u8) {
        if r & 0b10 != 0 {
            self.psd.cc = ConditionCode::from_bits_truncate(byte >> 4);
        }
        if r & 0b01 != 0 {
            self.psd.float = FloatMode::from_bits_truncate(byte & 7);
        }
    }

    /// The real address of a virtual word, without access checks
    fn translate(&self, word: Address) -> (Address, Option<Access>) {
        let word = word & C::ADDRESS_MASK;
        if self.psd.is_mapped() {
            let page = (word / C::PAGE_WORDS) as usize;
            (self.mapping.map_word(word), Some(self.mapping.entry(page).1))
        } else if self.psd.ma && word & 0x1_0000 != 0 {
            ((Address::from(self.psd.ext) << 16) | (word & 0xFFFF), None)
        } else {
            (word, None)
        }
    }

    fn load_real_address(&mut self, r: u8, ea: Address) {
        let (real, access) = self.translate(ea / C::WORD_BYTES);
        if real as usize >= self.memory.words() {
            self.psd.cc = ConditionCode::all();
            return;
        }

        let access = access.map_or(0, |access| access as u8);
        let page = (real / C::PAGE_WORDS) as usize;
        let lock = if page < C::WRITE_LOCK_PAGES {
            self.memory.lock(page)
        } else {
            0
        };
        self.set_reg(r, real);
        self.psd.cc = ConditionCode::from_bits_truncate((access << 2) | (lock & 3));
    }

    /// Describe the instruction at `ea` and put its effective address in R
    fn analyze(&mut self, r: u8, ea: Address) -> Result<(), Trap> {
        let target = Instruction(self.read_word(ea)?);
        let mut cc = ConditionCode::empty();
        cc.set(ConditionCode::CC4, target.indirect());

        let (class, size) = match target.opcode().map(Opcode::class) {
            Some(class @ OperandClass::Byte) => (class, 0),
            Some(class @ OperandClass::Halfword) => (class, 1),
            Some(class @ (OperandClass::Word | OperandClass::Address | OperandClass::Branch)) => {
                (class, 2)
            }
            Some(class @ OperandClass::Doubleword) => (class, 3),
            _ => {
                // No effective address
                self.psd.cc = cc | ConditionCode::CC3;
                return Ok(());
            }
        };

        let address = self.effective_address(target, class)?;
        self.set_reg(r, address >> size);
        self.psd.cc = cc | ConditionCode::from_bits_truncate(size << 2);
        Ok(())
    }

    /// WD mode 1: arm, enable and trigger interrupt levels
    fn interrupt_control(&mut self, function: u32, group: u32, selection: Word) {
        if group > 1 {
            debug!(group, "No interrupt levels in group");
            return;
        }

        let selection = selection as u16;
        if function == 6 {
            self.interrupts.set_enable_mask(group as u8, selection);
            return;
        }

        let levels = (0..16u8)
            .filter(|n| selection & (1 << n) != 0)
            .map(|n| group as u8 * 16 + n);
        for level in levels {
            match function {
                1 => self.interrupts.disarm(level),
                2 => {
                    self.interrupts.arm(level);
                    self.interrupts.enable(level);
                }
                3 => {
                    self.interrupts.arm(level);
                    self.interrupts.disable(level);
                }
                4 => self.interrupts.enable(level),
                5 => self.interrupts.disable(level),
                7 => {
                    self.interrupts.trigger(level);
                }
                _ => {}
            }
        }
        debug!(function, group, selection, "Interrupt control");
    }

    fn io_cc(&mut self, cc: ConditionCode) {
        self.psd.set_flags(
            cc.contains(ConditionCode::CC1),
            cc.contains(ConditionCode::CC2),
        );
    }

    fn io_status(&mut self, r: u8, result: IoResult) {
        self.io_cc(result.cc);
        if r != 0 {
            self.set_reg(r, result.command);
            self.set_reg(
                r | 1,
                (Word::from(result.status) << 16) | Word::from(result.byte_count),
            );
        }
    }

    fn acknowledge_io(&mut self, r: u8) {
        let Some(data) = self.interrupts.acknowledge(C::LEVEL_IO) else {
            self.psd.cc = ConditionCode::CC4;
            return;
        };

        let result = self.io.acknowledge(data.device_address);
        self.psd.cc = ConditionCode::empty();
        self.io_cc(result.cc);
        self.set_reg(
            r,
            (Word::from(result.status) << 16) | Word::from(data.device_address),
        );
        debug!(device = data.device_address, "Acknowledged I/O interrupt");
    }

    /// Move words into the access codes, write locks or memory map
    #[tracing::instrument(skip(self))]
    fn move_to_memory_control(&mut self, r: u8, function: u8) -> Result<(), Trap> {
        if !matches!(function, 1 | 2 | 4 | 5) {
            return Err(Trap::NonexistentInstruction);
        }

        let control = (r + 1) & 0xF;
        loop {
            let descriptor = self.reg(control);
            let count = match descriptor >> 24 {
                0 => 256,
                n => n,
            };
            let page = ((descriptor >> 9) & 0xFF) as usize;

            let source = self.reg(r) & C::ADDRESS_MASK;
            let word = self.read_word(source * C::WORD_BYTES)?;
            let next = match function {
                1 => self.mapping.set_access(page, word),
                2 => {
                    self.memory.set_locks(page, word);
                    (page + 16) % C::WRITE_LOCK_PAGES
                }
                4 => self.mapping.set_map(page, word),
                _ => self.mapping.set_map_wide(page, word),
            };

            let count = count - 1;
            self.set_reg(r, (source + 1) & C::ADDRESS_MASK);
            self.set_reg(
                control,
                ((count & 0xFF) << 24) | ((next as Word & 0xFF) << 9) | (descriptor & 0x00FE_01FF),
            );
            if count == 0 {
                return Ok(());
            }
        }
    }
}

impl Instruction {
    /// Execute the instruction. `depth` counts the EXU instructions leading here.
    pub(crate) fn execute(self, computer: &mut Computer, depth: usize) -> Result<(), Trap> {
        use Opcode::*;

        let Some(op) = self.opcode() else {
            return Err(Trap::NonexistentInstruction);
        };
        if op.is_privileged() && !computer.psd.is_master() {
            return Err(Trap::Privileged);
        }
        if op.feature().is_some_and(|feature| !computer.installs(feature)) {
            return Err(Trap::Unimplemented);
        }

        let class = op.class();
        let r = self.r();
        let ea = if class.has_reference() {
            computer.effective_address(self, class)?
        } else {
            0
        };
        let value = self.value();

        match op {
            Lcfi => computer.load_controls(r, value as u8),

            Cal1 | Cal2 | Cal3 | Cal4 => {
                return Err(Trap::Call {
                    number: op.code() - Cal1.code() + 1,
                    code: r,
                });
            }

            Plw => computer.pull_word(r, ea)?,
            Psw => computer.push_word(r, ea)?,
            Plm => computer.pull_multiple(r, ea)?,
            Psm => computer.push_multiple(r, ea)?,
            Msp => computer.modify_stack_pointer(r, ea)?,

            Lpsd => {
                let mut psd = Psd::from_doubleword(computer.read_doubleword(ea)?);
                if r & 0b1000 == 0 {
                    psd.rp = computer.psd.rp;
                }
                if r & 0b0010 != 0 {
                    let cleared = computer.interrupts.clear_highest_active(r & 0b0001 != 0);
                    debug!(?cleared, "Cleared interrupt level");
                }
                debug!(%psd, "Loading program status");
                computer.set_psd(psd);
                computer.suppress = 1;
            }

            Xpsd => {
                let current = computer.psd;
                computer.exchange(ea, r, current, None)?;
                computer.suppress = 1;
            }

            Ad => {
                let sum = add_wide(computer.reg_pair(r), computer.read_doubleword(ea)?, false, 64);
                computer.set_reg_pair(r, sum.result);
                computer.sum_cc(sum, 64)?;
            }

            Sd => {
                let sum = subtract_wide(computer.reg_pair(r), computer.read_doubleword(ea)?, 64);
                computer.set_reg_pair(r, sum.result);
                computer.sum_cc(sum, 64)?;
            }

            Cd => {
                let operand = computer.read_doubleword(ea)? as i64;
                let register = computer.reg_pair(r) as i64;
                computer.compare_cc(register, operand, None);
            }

            Ld => {
                let value = computer.read_doubleword(ea)?;
                computer.set_reg_pair(r, value);
                computer.psd.set_sign(value as i64);
            }

            Std => {
                let value = computer.reg_pair(r);
                computer.write_doubleword(ea, value)?;
            }

            Clm => {
                let limits = computer.read_doubleword(ea)?;
                computer.limits_cc(r, (limits >> 32) as Word, limits as Word);
            }

            Lcd | Lad => {
                let operand = computer.read_doubleword(ea)? as i64;
                let negate = op == Lcd || operand < 0;
                let result = if negate { operand.wrapping_neg() } else { operand };
                computer.set_reg_pair(r, result as Doubleword);
                computer.complement_cc(negate && operand == i64::MIN, result)?;
            }

            Fsl | Fal | Fdl | Fml | Fss | Fas | Fds | Fms => computer.floating(op, r, ea)?,
            Sf => computer.shift_floating(r, ea / C::WORD_BYTES)?,

            Ai => {
                let sum = add_wide(u64::from(computer.reg(r)), value as u64, false, 32);
                computer.set_reg(r, sum.result as Word);
                computer.sum_cc(sum, 32)?;
            }

            Ci => {
                let register = computer.reg(r);
                let mask = register & value as Word;
                computer.compare_cc(word_sign(register), i64::from(value), Some(mask));
            }

            Li => computer.load_cc(r, value as Word),
            Mi => computer.multiply(r, i64::from(value)),

            S => computer.shift(r, ea / C::WORD_BYTES),

            Las => {
                let old = computer.update_word(ea, |word| word | 0x8000_0000)?;
                computer.load_cc(r, old);
            }

            Cvs => computer.convert_by_subtraction(r, ea)?,
            Cva => computer.convert_by_addition(r, ea)?,

            Lm => {
                let count = multiple_count(computer.psd.cc);
                for i in 0..count {
                    let word = computer.read_word(ea + Address::from(i) * C::WORD_BYTES)?;
                    computer.set_reg((r + i) & 0xF, word);
                }
            }

            Stm => {
                let count = multiple_count(computer.psd.cc);
                for i in 0..count {
                    let word = computer.reg((r + i) & 0xF);
                    computer.write_word(ea + Address::from(i) * C::WORD_BYTES, word)?;
                }
            }

            Lra => computer.load_real_address(r, ea),

            Wait => {
                debug!(ia = computer.psd.ia, "Waiting for an interrupt");
                computer.waiting = true;
                computer.statistics.waits += 1;
            }

            Lrp => {
                let word = computer.read_word(ea)?;
                computer.psd.rp = ((word >> 4) & 0xF) as u8;
                trace!(rp = computer.psd.rp, "Register block selected");
            }

            Aw => {
                let operand = u64::from(computer.read_word(ea)?);
                let sum = add_wide(u64::from(computer.reg(r)), operand, false, 32);
                computer.set_reg(r, sum.result as Word);
                computer.sum_cc(sum, 32)?;
            }

            Sw => {
                let operand = u64::from(computer.read_word(ea)?);
                let sum = subtract_wide(u64::from(computer.reg(r)), operand, 32);
                computer.set_reg(r, sum.result as Word);
                computer.sum_cc(sum, 32)?;
            }

            Cw => {
                let operand = computer.read_word(ea)?;
                let register = computer.reg(r);
                let mask = register & operand;
                computer.compare_cc(word_sign(register), word_sign(operand), Some(mask));
            }

            Lw => {
                let word = computer.read_word(ea)?;
                computer.load_cc(r, word);
            }

            Stw => {
                let word = computer.reg(r);
                computer.write_word(ea, word)?;
            }

            Mtw | Mth | Mtb => {
                let (size, bits) = match op {
                    Mtb => (1, 8),
                    Mth => (2, 16),
                    _ => (4, 32),
                };
                let delta = self.delta();
                if delta == 0 {
                    let value = match op {
                        Mtb => i64::from(computer.read_byte(ea)?),
                        Mth => i64::from(computer.read_half(ea)? as i16),
                        _ => word_sign(computer.read_word(ea)?),
                    };
                    computer.psd.set_flags(false, false);
                    computer.psd.set_sign(value);
                } else {
                    let modified = computer.modify(ea, delta, size)?;
                    let overflow = op != Mtb && modified.overflow;
                    computer.psd.set_flags(modified.carry, overflow);
                    let result = if op == Mtb {
                        i64::from(modified.result)
                    } else {
                        signed(u64::from(modified.result), bits)
                    };
                    computer.psd.set_sign(result);
                    computer.overflow_trap(overflow)?;
                }
            }

            Dw => {
                let divisor = word_sign(computer.read_word(ea)?);
                computer.divide_word(r, divisor)?;
            }

            Mw => {
                let operand = word_sign(computer.read_word(ea)?);
                computer.multiply(r, operand);
            }

            Clr => {
                let second = computer.read_word(ea)?;
                let first = computer.reg(r | 1);
                computer.limits_cc(r, first, second);
            }

            Lcw | Law => {
                let operand = computer.read_word(ea)? as i32;
                let negate = op == Lcw || operand < 0;
                let result = if negate { operand.wrapping_neg() } else { operand };
                computer.set_reg(r, result as Word);
                computer.complement_cc(negate && operand == i32::MIN, i64::from(result))?;
            }

            Ttbs => computer.translate_and_test(r, value)?,
            Tbs => computer.translate_string(r, value)?,
            Cbs => computer.compare_strings(r, value)?,
            Mbs => computer.move_string(r, value)?,
            Ebs => computer.edit_string(r, value)?,

            Anlz => computer.analyze(r, ea)?,

            Cs => {
                let mask = computer.reg(r | 1);
                let operand = computer.read_word(ea)? & mask;
                let register = computer.reg(r) & mask;
                let mask = register & operand;
                computer.compare_cc(i64::from(register), i64::from(operand), Some(mask));
            }

            Xw => {
                let register = computer.reg(r);
                let old = computer.update_word(ea, |_| register)?;
                computer.load_cc(r, old);
            }

            Sts => {
                let mask = computer.reg(r | 1);
                let register = computer.reg(r);
                computer.update_word(ea, |word| (word & !mask) | (register & mask))?;
            }

            Eor | Or | And => {
                let operand = computer.read_word(ea)?;
                let register = computer.reg(r);
                let result = match op {
                    Eor => register ^ operand,
                    Or => register | operand,
                    _ => register & operand,
                };
                computer.load_cc(r, result);
            }

            Ls => {
                let mask = computer.reg(r | 1);
                let operand = computer.read_word(ea)?;
                let result = (computer.reg(r) & !mask) | (operand & mask);
                computer.load_cc(r, result);
            }

            Sio | Tio | Tdv | Hio => {
                let unit = ((ea / C::WORD_BYTES) & 0x7FF) as u16;
                let result = match op {
                    Sio => {
                        let command = computer.reg(0) & C::ADDRESS_MASK;
                        debug!(unit, command, "Starting I/O");
                        computer.io.start(unit, command)
                    }
                    Tio => computer.io.test(unit),
                    Tdv => computer.io.test_device(unit),
                    _ => computer.io.halt(unit),
                };
                trace!(unit, ?result, "I/O instruction");
                computer.io_status(r, result);
            }

            Ah | Sh => {
                let operand = computer.read_half(ea)? as i16 as i64 as u64;
                let register = u64::from(computer.reg(r));
                let sum = if op == Ah {
                    add_wide(register, operand, false, 32)
                } else {
                    subtract_wide(register, operand, 32)
                };
                computer.set_reg(r, sum.result as Word);
                computer.sum_cc(sum, 32)?;
            }

            Ch => {
                let operand = computer.read_half(ea)? as i16;
                let register = computer.reg(r);
                computer.compare_cc(
                    word_sign(register),
                    i64::from(operand),
                    Some(register & operand as i32 as Word),
                );
            }

            Lh => {
                let half = computer.read_half(ea)? as i16;
                computer.load_cc(r, half as i32 as Word);
            }

            Sth => {
                let register = computer.reg(r);
                computer.write_half(ea, register as u16)?;
                let fits = i16::try_from(register as i32).is_ok();
                computer.psd.cc.set(ConditionCode::CC2, !fits);
            }

            Lch | Lah => {
                let operand = i32::from(computer.read_half(ea)? as i16);
                let result = if op == Lch || operand < 0 { -operand } else { operand };
                computer.set_reg(r, result as Word);
                computer.psd.cc.set(ConditionCode::CC2, false);
                computer.psd.set_sign(i64::from(result));
            }

            Dh => {
                let divisor = i64::from(computer.read_half(ea)? as i16);
                let dividend = word_sign(computer.reg(r));
                match dividend
                    .checked_div(divisor)
                    .filter(|quotient| i32::try_from(*quotient).is_ok())
                {
                    Some(quotient) => {
                        computer.set_reg(r, quotient as Word);
                        computer.psd.cc.set(ConditionCode::CC2, false);
                        computer.psd.set_sign(quotient.signum());
                    }
                    None => {
                        computer.psd.cc.set(ConditionCode::CC2, true);
                        computer.overflow_trap(true)?;
                    }
                }
            }

            Mh => {
                let operand = i64::from(computer.read_half(ea)? as i16);
                let product = i64::from(computer.reg(r) as u16 as i16) * operand;
                computer.set_reg(r | 1, product as Word);
                computer.psd.cc.set(ConditionCode::CC2, false);
                computer.psd.set_sign(product.signum());
            }

            Bdr | Bir => {
                let step = if op == Bdr { Word::MAX } else { 1 };
                let result = computer.reg(r).wrapping_add(step);
                computer.set_reg(r, result);
                let taken = if op == Bdr {
                    (result as i32) > 0
                } else {
                    (result as i32) < 0
                };
                if taken {
                    computer.branch(ea);
                }
            }

            Awm => {
                let register = u64::from(computer.reg(r));
                let old = computer.update_word(ea, |word| {
                    add_wide(u64::from(word), register, false, 32).result as Word
                })?;
                let sum = add_wide(u64::from(old), register, false, 32);
                computer.sum_cc(sum, 32)?;
            }

            Exu => {
                let word = computer.read_word(ea)?;
                if depth >= C::EXU_LIMIT {
                    return Err(Trap::Watchdog);
                }
                trace!(depth, subject = %Instruction(word), "Executing subject instruction");
                return Instruction(word).execute(computer, depth + 1);
            }

            Bcr => {
                if (computer.psd.cc.bits() & r) == 0 {
                    computer.branch(ea);
                }
            }

            Bcs => {
                if (computer.psd.cc.bits() & r) != 0 {
                    computer.branch(ea);
                }
            }

            Bal => {
                let link = computer.psd.ia;
                computer.set_reg(r, link);
                computer.branch(ea);
            }

            Int => {
                let word = computer.read_word(ea)?;
                computer.psd.cc = ConditionCode::from_bits_truncate((word >> 28) as u8);
                computer.set_reg(r, (word >> 16) & 0xFFF);
                computer.set_reg(r | 1, word & 0xFFFF);
            }

            Rd => {
                let address = ((ea / C::WORD_BYTES) & 0xFFFF) as u16;
                let (cc, word) = computer.io.read_direct(address);
                if r != 0 {
                    computer.set_reg(r, word);
                }
                computer.io_cc(cc);
            }

            Wd => {
                let address = (ea / C::WORD_BYTES) & 0xFFFF;
                let register = computer.reg(r);
                if (address >> 12) & 0xF == 1 {
                    computer.interrupt_control((address >> 8) & 7, address & 0xF, register);
                } else {
                    let cc = computer.io.write_direct(address as u16, register);
                    computer.io_cc(cc);
                }
            }

            Aio => computer.acknowledge_io(r),

            Mmc => computer.move_to_memory_control(r, self.x())?,

            Lcf => {
                let byte = computer.read_byte(ea)?;
                computer.load_controls(r, byte);
            }

            Stcf => {
                let byte = (computer.psd.cc.bits() << 4) | computer.psd.float.bits();
                computer.write_byte(ea, byte)?;
            }

            Cb => {
                let operand = computer.read_byte(ea)?;
                let register = computer.reg(r) & 0xFF;
                computer.compare_cc(i64::from(register), i64::from(operand), None);
            }

            Lb => {
                let byte = computer.read_byte(ea)?;
                computer.load_cc(r, Word::from(byte));
            }

            Stb => {
                let register = computer.reg(r);
                computer.write_byte(ea, register as u8)?;
            }

            Pack => computer.pack(r, ea)?,
            Unpk => computer.unpack(r, ea)?,
            Ds | Da | Dd | Dm | Dc | Dl | Dst => computer.decimal(op, r, ea)?,
            Dsa => computer.decimal_shift(ea / C::WORD_BYTES)?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::super::tests::{assemble, computer_with, install_handler};
    use super::super::{Inhibit, InterruptData, LevelState, Step, Trap, Width};
    use super::*;

    #[test]
    fn add_wide_test() {
        assert_eq!(
            add_wide(0x7FFF_FFFF, 1, false, 32),
            Sum {
                result: 0x8000_0000,
                carry: false,
                overflow: true
            }
        );
        assert_eq!(
            add_wide(0xFFFF_FFFF, 1, false, 32),
            Sum {
                result: 0,
                carry: true,
                overflow: false
            }
        );
        // No borrow sets the carry
        assert!(subtract_wide(5, 3, 32).carry);
        assert!(!subtract_wide(3, 5, 32).carry);
        assert_eq!(signed(0xFF, 8), -1);
    }

    #[test]
    fn arithmetic_test() {
        let mut computer = computer_with(indoc! {"
            LI,1    X'7FFFF'
            AI,1    1
            LI,2    -5
            AW,2    X'400'
            SW,2    X'401'
            AH,2    X'402'
        "});
        computer.load_words(0x400, &[7, 10, 0xFFFE_0000]).unwrap();

        computer.run(2);
        assert_eq!(computer.reg(1), 0x8_0000);
        assert_eq!(computer.psd.cc, ConditionCode::CC3);

        computer.run(2);
        assert_eq!(computer.reg(2), 2);
        assert_eq!(computer.psd.cc, ConditionCode::CC1 | ConditionCode::CC3);

        computer.run(1);
        assert_eq!(computer.reg(2) as i32, -8);
        assert_eq!(computer.psd.cc, ConditionCode::CC4);

        computer.run(1);
        assert_eq!(computer.reg(2) as i32, -10);
    }

    #[test]
    fn overflow_trap_test() {
        let mut computer = computer_with(indoc! {"
            LI,1    1
            AW,1    X'400'
            LI,2    1
        "});
        computer.load_words(0x400, &[0x7FFF_FFFF]).unwrap();
        install_handler(&mut computer, C::TRAP_FIXED_OVERFLOW, 0);

        // Without AM only CC2 reports the overflow
        computer.run(2);
        assert_eq!(computer.reg(1), 0x8000_0000);
        assert_eq!(computer.psd.cc, ConditionCode::CC2 | ConditionCode::CC4);
        assert_eq!(computer.pending_trap(), None);

        computer.psd.ia = 0x101;
        computer.set_reg(1, 1);
        computer.psd.mode = Mode::ARITHMETIC_TRAP;
        computer.cycle();
        // The result is stored and the trap does not back up
        assert_eq!(computer.reg(1), 0x8000_0000);
        assert_eq!(computer.pending_trap().map(|t| t.trap), Some(Trap::FixedOverflow));
        computer.cycle();
        let saved = computer.peek(Width::Doubleword, (0x200 + 12) * 4, false).unwrap();
        assert_eq!(Psd::from_doubleword(saved).ia, 0x102);
    }

    #[test]
    fn compare_test() {
        let mut computer = computer_with(indoc! {"
            LI,1    5
            CI,1    7
            CI,1    4
            CW,1    X'400'
            CLR,4   X'401'
        "});
        computer.load_words(0x400, &[1, 10]).unwrap();
        computer.set_reg(4, 5);

        computer.run(2);
        assert_eq!(computer.psd.cc, ConditionCode::CC2 | ConditionCode::CC4);
        computer.run(1);
        assert_eq!(computer.psd.cc, ConditionCode::CC2 | ConditionCode::CC3);
        computer.run(1);
        assert_eq!(computer.psd.cc, ConditionCode::CC2 | ConditionCode::CC3);

        // R4 = 5 against R5 = 0, then against 10
        computer.run(1);
        assert_eq!(computer.psd.cc, ConditionCode::CC1 | ConditionCode::CC4);
    }

    #[test]
    fn multiply_divide_test() {
        let mut computer = computer_with(indoc! {"
            LI,3    X'10000'
            MW,2    X'400'
            DW,2    X'401'
            LI,5    7
            MI,5    -3
            DW,5    X'402'
        "});
        computer.load_words(0x400, &[0x10000, 3, 0]).unwrap();

        computer.run(2);
        assert_eq!((computer.reg(2), computer.reg(3)), (1, 0));
        assert_eq!(computer.psd.cc, ConditionCode::CC2 | ConditionCode::CC3);

        computer.run(1);
        assert_eq!((computer.reg(2), computer.reg(3)), (1, 0x5555_5555));
        assert_eq!(computer.psd.cc, ConditionCode::CC3);

        computer.run(2);
        assert_eq!(computer.reg(5) as i32, -21);

        // Division by zero leaves the register alone
        computer.run(1);
        assert_eq!(computer.reg(5) as i32, -21);
        assert!(computer.psd.cc.contains(ConditionCode::CC2));
    }

    #[test]
    fn shift_test() {
        let mut computer = computer_with(indoc! {"
            S,1     4
            S,2     X'27F'
            S,3     X'404'
            S,4     X'402'
            S,6     X'104'
            S,8     X'604'
        "});
        computer.set_reg(1, 0x1234_5678);
        computer.set_reg(2, 0x8000_0001);
        computer.set_reg(3, 0x8000_0001);
        computer.set_reg(4, 0x2000_0000);
        computer.set_reg(6, 0x0000_0001);
        computer.set_reg(7, 0x8000_0000);
        computer.set_reg(8, 0x0100_0000);

        computer.run(1);
        assert_eq!(computer.reg(1), 0x2345_6780);
        assert_eq!(computer.psd.cc, ConditionCode::CC1 | ConditionCode::CC3);

        // Circular right by one
        computer.run(1);
        assert_eq!(computer.reg(2), 0xC000_0000);

        computer.run(1);
        assert_eq!(computer.reg(3), 0x0000_0010);
        assert!(computer.psd.cc.contains(ConditionCode::CC2));

        computer.run(1);
        assert_eq!(computer.reg(4), 0x8000_0000);
        assert_eq!(computer.psd.cc, ConditionCode::CC2 | ConditionCode::CC4);

        // Logical double: R7's sign bit moves into R6
        computer.run(1);
        assert_eq!((computer.reg(6), computer.reg(7)), (0x18, 0));

        // The count runs out before a one reaches bit 0
        computer.run(1);
        assert_eq!(computer.reg(8), 0x1000_0000);
        assert_eq!(computer.reg(1), 0);
    }

    #[test]
    fn selective_and_logical_test() {
        let mut computer = computer_with(indoc! {"
            LS,2    X'400'
            STS,2   X'401'
            OR,2    X'400'
            AND,2   X'402'
            EOR,2   X'402'
            XW,2    X'401'
        "});
        computer.load_words(0x400, &[0xAAAA_AAAA, 0x1111_1111, 0x0F0F_0F0F]).unwrap();
        computer.set_reg(2, 0x5555_5555);
        computer.set_reg(3, 0xFFFF_0000);

        computer.run(1);
        assert_eq!(computer.reg(2), 0xAAAA_5555);
        computer.run(1);
        assert_eq!(computer.memory().load_word(0x401 * 4).unwrap(), 0xAAAA_1111);
        computer.run(1);
        assert_eq!(computer.reg(2), 0xAAAA_FFFF);
        computer.run(1);
        assert_eq!(computer.reg(2), 0x0A0A_0F0F);
        computer.run(1);
        assert_eq!(computer.reg(2), 0x0505_0000);
        computer.run(1);
        assert_eq!(computer.reg(2), 0xAAAA_1111);
        assert_eq!(computer.memory().load_word(0x401 * 4).unwrap(), 0x0505_0000);
    }

    #[test]
    fn load_complement_test() {
        let mut computer = computer_with(indoc! {"
            LCW,1   X'400'
            LAW,2   X'401'
            LCW,3   X'402'
            LAH,4   X'403'
            LCD,6   X'402'
        "});
        computer
            .load_words(0x400, &[5, 0xFFFF_FFF9, 0x8000_0000, 0xFFFE_0000])
            .unwrap();

        computer.run(3);
        assert_eq!(computer.reg(1) as i32, -5);
        assert_eq!(computer.reg(2), 7);
        assert_eq!(computer.reg(3), 0x8000_0000);
        assert!(computer.psd.cc.contains(ConditionCode::CC2));

        computer.run(1);
        assert_eq!(computer.reg(4), 2);

        computer.run(1);
        assert_eq!(computer.reg_pair(6), 0x7FFF_FFFF_0002_0000);
        assert_eq!(computer.psd.cc, ConditionCode::CC3);
    }

    #[test]
    fn modify_and_test_test() {
        let mut computer = computer_with(indoc! {"
            MTW,-1  X'400'
            MTH,1   X'401',7
            MTB,1   X'404',7
            MTW,0   X'400'
            AWM,1   X'400'
        "});
        computer.load_words(0x400, &[1, 0x0000_7FFF]).unwrap();
        computer.set_reg(1, 10);
        computer.set_reg(7, 1);

        computer.run(1);
        assert_eq!(computer.memory().load_word(0x400 * 4).unwrap(), 0);
        assert_eq!(computer.psd.cc, ConditionCode::CC1);

        computer.run(1);
        assert_eq!(computer.memory().load_half(0x401 * 4 + 2).unwrap(), 0x8000);
        assert_eq!(computer.psd.cc, ConditionCode::CC2 | ConditionCode::CC4);

        computer.run(1);
        assert_eq!(computer.memory().load_byte(0x1011).unwrap(), 1);
        assert_eq!(computer.psd.cc, ConditionCode::CC3);

        computer.run(1);
        assert_eq!(computer.psd.cc, ConditionCode::empty());

        computer.run(1);
        assert_eq!(computer.memory().load_word(0x400 * 4).unwrap(), 10);
        assert_eq!(computer.psd.cc, ConditionCode::CC3);
    }

    #[test]
    fn load_and_set_test() {
        let mut computer = computer_with("LAS,1 X'400'");
        computer.load_words(0x400, &[0x42]).unwrap();

        computer.run(1);
        assert_eq!(computer.reg(1), 0x42);
        assert_eq!(computer.memory().load_word(0x400 * 4).unwrap(), 0x8000_0042);
    }

    #[test]
    fn multiple_test() {
        let mut computer = computer_with(indoc! {"
            LCFI,2  X'30'
            LM,14   X'400'
            STM,15  X'500'
        "});
        computer.load_words(0x400, &[1, 2, 3]).unwrap();

        computer.run(3);
        assert_eq!((computer.reg(14), computer.reg(15), computer.reg(0)), (1, 2, 3));
        assert_eq!(computer.memory().load_word(0x500 * 4).unwrap(), 2);
        assert_eq!(computer.memory().load_word(0x502 * 4).unwrap(), 0);
    }

    #[test]
    fn branch_test() {
        let mut computer = computer_with(indoc! {"
            LI,1    -1
            BCS,1   X'104'
            LI,2    1
            LI,2    2
            BAL,3   X'200'
        "});

        computer.run(2);
        assert_eq!(computer.psd.ia, 0x104);
        computer.run(1);
        assert_eq!(computer.psd.ia, 0x200);
        assert_eq!(computer.reg(3), 0x105);
        assert_eq!(computer.reg(2), 0);
    }

    #[test]
    fn execute_test() {
        let mut computer = computer_with(indoc! {"
            EXU     X'400'
            EXU     X'401'
        "});
        computer.load_words(0x400, &assemble("LI,4 9\nEXU X'401'")).unwrap();
        install_handler(&mut computer, C::TRAP_WATCHDOG, 0);

        computer.run(1);
        assert_eq!(computer.reg(4), 9);
        assert_eq!(computer.psd.ia, 0x101);

        computer.cycle();
        assert_eq!(computer.pending_trap().map(|t| t.trap), Some(Trap::Watchdog));
        assert_eq!(computer.psd.ia, 0x102);
    }

    #[test]
    fn interpret_and_analyze_test() {
        let mut computer = computer_with(indoc! {"
            INT,2   X'400'
            LI,5    3
            ANLZ,6  X'401'
            ANLZ,7  X'402'
        "});
        computer
            .load_words(0x400, &[0x5123_4567, 0xD2A0_0410, 0x2210_0005])
            .unwrap();
        // LH,10 *X'410' through X'420'
        computer.load_words(0x410, &[0x420]).unwrap();

        computer.run(1);
        assert_eq!(computer.psd.cc, ConditionCode::CC2 | ConditionCode::CC4);
        assert_eq!((computer.reg(2), computer.reg(3)), (0x123, 0x4567));

        computer.run(2);
        assert_eq!(computer.reg(6), 0x840);
        assert_eq!(computer.psd.cc, ConditionCode::CC2 | ConditionCode::CC4);

        computer.run(1);
        assert_eq!(computer.psd.cc, ConditionCode::CC3);
    }

    #[test]
    fn load_psd_test() {
        let mut computer = computer_with(indoc! {"
            LPSD,11 X'400'
        "});
        let psd = Psd {
            ia: 0x180,
            cc: ConditionCode::CC1,
            rp: 2,
            ..Psd::default()
        };
        let (word0, word1) = psd.words();
        computer.load_words(0x400, &[word0, word1]).unwrap();
        computer.interrupts().arm(20);
        computer.interrupts().enable(20);
        computer.interrupts().trigger(20);
        let vector = C::INTERRUPT_BASE + 20;
        install_handler(&mut computer, vector, 0);
        computer.cycle();
        assert_eq!(computer.interrupts().highest_active(), Some(20));

        computer.psd.ia = 0x100;
        computer.cycle();
        assert_eq!(computer.psd.ia, 0x180);
        assert_eq!(computer.psd.rp, 2);
        assert_eq!(computer.interrupts().level(20).state, LevelState::Armed);
    }

    #[test]
    fn interrupt_control_test() {
        let mut computer = computer_with(indoc! {"
            WD,1    X'1201'
            WD,2    X'1701'
            WD,2    X'1101'
        "});
        computer.set_reg(1, 0b101);
        computer.set_reg(2, 0b100);
        computer.psd.inhibit = Inhibit::EXTERNAL;

        computer.run(1);
        assert_eq!(computer.interrupts().level(16).state, LevelState::Armed);
        assert!(computer.interrupts().level(18).enabled);
        assert_eq!(computer.interrupts().level(17).state, LevelState::Disarmed);

        computer.run(1);
        assert_eq!(computer.interrupts().level(18).state, LevelState::Waiting);
        computer.run(1);
        assert_eq!(computer.interrupts().level(18).state, LevelState::Disarmed);
    }

    #[test]
    fn memory_control_test() {
        let mut computer = computer_with(indoc! {"
            MMC,2   0,4
            MMC,4   0,1
        "});
        computer.load_words(0x400, &[0x0102_0304, 0x0506_0708, 0x4000_0000]).unwrap();
        // Two map words from X'400' into pages 8 onwards
        computer.set_reg(2, 0x400);
        computer.set_reg(3, (2 << 24) | (8 << 9));
        computer.set_reg(4, 0x402);
        computer.set_reg(5, 1 << 24);

        computer.run(1);
        assert_eq!(computer.mapping.entry(8).0, 1);
        assert_eq!(computer.mapping.entry(15).0, 8);
        assert_eq!(computer.reg(2), 0x402);
        assert_eq!(computer.reg(3), 16 << 9);

        computer.run(1);
        assert_eq!(computer.mapping.entry(0).1, Access::Read);
        assert_eq!(computer.mapping.entry(1).1, Access::Write);
    }

    #[test]
    fn load_real_address_test() {
        let mut computer = computer_with("LRA,1 X'1204'");
        computer.mapping.set_map(0, 0);
        computer.mapping.set_map(8, 0x0011_0000);
        // Page 9 is execute-only
        computer.mapping.set_access(0, 2 << 12);
        computer.psd.mode = Mode::MAPPED;
        computer.memory().set_lock(0x11, 3);

        computer.run(1);
        assert_eq!(computer.reg(1), 0x11 * 512 + 4);
        assert_eq!(computer.psd.cc, ConditionCode::CC1 | ConditionCode::CC3 | ConditionCode::CC4);
    }

    #[test]
    fn privileged_in_slave_test() {
        let mut computer = computer_with("LRP X'400'");
        computer.psd.mode = Mode::SLAVE;
        computer.cycle();
        assert_eq!(computer.pending_trap().map(|t| t.trap), Some(Trap::Privileged));
    }

    #[test]
    fn acknowledge_io_test() {
        let mut computer = computer_with(indoc! {"
            AIO,4   0
            AIO,4   0
        "});
        computer.interrupts().arm(C::LEVEL_IO);
        computer.interrupts().post(InterruptData::new(C::LEVEL_IO).with_device(0x0F0, 3));

        computer.psd.inhibit = Inhibit::IO;
        computer.run(1);
        assert_eq!(computer.reg(4), 0x0F0);
        assert_eq!(computer.psd.cc, ConditionCode::empty());

        assert_eq!(computer.run(1), Step::Continue);
        assert_eq!(computer.psd.cc, ConditionCode::CC4);
    }
}
