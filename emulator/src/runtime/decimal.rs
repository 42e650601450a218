//! Packed decimal.
//!
//! Registers 12 through 15 hold the decimal accumulator, 31 digits and a sign
//! packed into 16 bytes. Memory operands are L bytes long, L being the R
//! field of the instruction (0 meaning 16).

use tracing::trace;

use super::instructions::ordering;
use super::{Computer, ConditionCode, Mode, Trap};
use crate::codec::Opcode;
use crate::constants::{Address, Word};

const ACCUMULATOR: u8 = 12;
const ACCUMULATOR_BYTES: usize = 16;

const PLUS: u8 = 0xC;
const MINUS: u8 = 0xD;

/// Zones written by UNPK
const ZONE: u8 = 0xF0;
const MINUS_ZONE: u8 = 0xD0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecimalFault {
    IllegalDigit,
    Overflow,
}

impl DecimalFault {
    const fn cc(self) -> ConditionCode {
        match self {
            Self::IllegalDigit => ConditionCode::CC1,
            Self::Overflow => ConditionCode::CC2,
        }
    }
}

const fn is_minus(sign: u8) -> bool {
    matches!(sign, 0xB | 0xD)
}

fn limit(digits: usize) -> i128 {
    10i128.pow(digits as u32)
}

/// Decode a packed field; the last nibble is the sign
fn from_packed(bytes: &[u8]) -> Result<i128, DecimalFault> {
    let Some((last, digits)) = bytes.split_last() else {
        return Ok(0);
    };

    let mut value: i128 = 0;
    let nibbles = digits
        .iter()
        .flat_map(|byte| [byte >> 4, byte & 0xF])
        .chain(std::iter::once(last >> 4));
    for digit in nibbles {
        if digit > 9 {
            return Err(DecimalFault::IllegalDigit);
        }
        value = value * 10 + i128::from(digit);
    }

    match last & 0xF {
        sign if sign < 0xA => Err(DecimalFault::IllegalDigit),
        sign if is_minus(sign) => Ok(-value),
        _ => Ok(value),
    }
}

/// Encode into `length` bytes, 2·length−1 digits
fn to_packed(value: i128, length: usize) -> Result<Vec<u8>, DecimalFault> {
    if value.abs() >= limit(length * 2 - 1) {
        return Err(DecimalFault::Overflow);
    }

    let mut bytes = vec![0; length];
    let mut magnitude = value.unsigned_abs();
    let mut nibbles = Vec::with_capacity(length * 2);
    nibbles.push(if value < 0 { MINUS } else { PLUS });
    for _ in 1..length * 2 {
        nibbles.push((magnitude % 10) as u8);
        magnitude /= 10;
    }

    for (i, pair) in nibbles.chunks(2).enumerate() {
        bytes[length - 1 - i] = pair[0] | (pair[1] << 4);
    }
    Ok(bytes)
}

fn operand_length(r: u8) -> usize {
    match r {
        0 => 16,
        n => usize::from(n),
    }
}

/// Either a memory trap or a decimal fault, the latter subject to DM
enum DecimalError {
    Fault(DecimalFault),
    Trap(Trap),
}

impl From<DecimalFault> for DecimalError {
    fn from(fault: DecimalFault) -> Self {
        Self::Fault(fault)
    }
}

impl From<Trap> for DecimalError {
    fn from(trap: Trap) -> Self {
        Self::Trap(trap)
    }
}

impl Computer {
    /// A decimal fault traps with DM set, otherwise it is only reported in the CC
    pub(super) fn decimal_fault(&mut self, cc: ConditionCode) -> Result<(), Trap> {
        trace!(?cc, "Decimal fault");
        if self.psd.mode.contains(Mode::DECIMAL_TRAP) {
            Err(Trap::Decimal(cc))
        } else {
            self.psd.cc = cc;
            Ok(())
        }
    }

    fn settle_decimal(&mut self, result: Result<(), DecimalError>) -> Result<(), Trap> {
        match result {
            Ok(()) => Ok(()),
            Err(DecimalError::Trap(trap)) => Err(trap),
            Err(DecimalError::Fault(fault)) => self.decimal_fault(fault.cc()),
        }
    }

    fn accumulator_bytes(&self) -> [u8; ACCUMULATOR_BYTES] {
        let mut bytes = [0; ACCUMULATOR_BYTES];
        for (i, chunk) in bytes.chunks_mut(4).enumerate() {
            chunk.copy_from_slice(&self.reg(ACCUMULATOR + i as u8).to_be_bytes());
        }
        bytes
    }

    fn accumulator(&self) -> Result<i128, DecimalFault> {
        from_packed(&self.accumulator_bytes())
    }

    /// Store packed bytes in consecutive registers starting at `first`
    fn set_registers(&mut self, first: u8, bytes: &[u8]) {
        for (i, chunk) in bytes.chunks(4).enumerate() {
            let mut word = [0; 4];
            word.copy_from_slice(chunk);
            self.set_reg(first + i as u8, Word::from_be_bytes(word));
        }
    }

    fn load_accumulator(&mut self, value: i128) -> Result<(), DecimalError> {
        let bytes = to_packed(value, ACCUMULATOR_BYTES)?;
        self.set_registers(ACCUMULATOR, &bytes);
        self.finish_decimal(value);
        Ok(())
    }

    fn finish_decimal(&mut self, value: i128) {
        self.psd.set_flags(false, false);
        self.psd.set_sign(value.signum() as i64);
    }

    fn read_field(&mut self, ea: Address, length: usize) -> Result<Vec<u8>, Trap> {
        (0..length)
            .map(|i| self.read_byte(ea + i as Address))
            .collect()
    }

    fn write_field(&mut self, ea: Address, bytes: &[u8]) -> Result<(), Trap> {
        for (i, byte) in bytes.iter().enumerate() {
            self.write_byte(ea + i as Address, *byte)?;
        }
        Ok(())
    }

    /// DL, DST, DA, DS, DM, DD and DC
    pub(super) fn decimal(&mut self, op: Opcode, r: u8, ea: Address) -> Result<(), Trap> {
        let result = self.decimal_operation(op, ea, operand_length(r));
        self.settle_decimal(result)
    }

    fn decimal_operation(
        &mut self,
        op: Opcode,
        ea: Address,
        length: usize,
    ) -> Result<(), DecimalError> {
        if op == Opcode::Dst {
            let bytes = to_packed(self.accumulator()?, length)?;
            self.write_field(ea, &bytes)?;
            return Ok(());
        }

        let operand = from_packed(&self.read_field(ea, length)?)?;
        if op == Opcode::Dl {
            return self.load_accumulator(operand);
        }

        let accumulator = self.accumulator()?;
        match op {
            Opcode::Da => self.load_accumulator(accumulator + operand),
            Opcode::Ds => self.load_accumulator(accumulator - operand),
            Opcode::Dm => {
                let product = accumulator.checked_mul(operand).ok_or(DecimalFault::Overflow)?;
                self.load_accumulator(product)
            }
            Opcode::Dd => {
                if operand == 0 {
                    return Err(DecimalFault::Overflow.into());
                }
                let quotient = to_packed(accumulator / operand, 8)?;
                let remainder = to_packed(accumulator % operand, 8)?;
                self.set_registers(ACCUMULATOR, &remainder);
                self.set_registers(ACCUMULATOR + 2, &quotient);
                self.finish_decimal(accumulator / operand);
                Ok(())
            }
            Opcode::Dc => {
                self.psd.set_flags(false, false);
                self.psd.set_sign(ordering(accumulator, operand));
                Ok(())
            }
            _ => Err(Trap::NonexistentInstruction.into()),
        }
    }

    /// PACK: the 2L−1 zoned bytes at EA into the accumulator, the sign coming
    /// from the zone of the last byte
    pub(super) fn pack(&mut self, r: u8, ea: Address) -> Result<(), Trap> {
        let result = self.pack_zoned(operand_length(r) * 2 - 1, ea);
        self.settle_decimal(result)
    }

    fn pack_zoned(&mut self, digits: usize, ea: Address) -> Result<(), DecimalError> {
        let zoned = self.read_field(ea, digits)?;

        let mut value: i128 = 0;
        for byte in &zoned {
            let digit = byte & 0xF;
            if digit > 9 {
                return Err(DecimalFault::IllegalDigit.into());
            }
            value = value * 10 + i128::from(digit);
        }
        if zoned.last().is_some_and(|byte| is_minus(byte >> 4)) {
            value = -value;
        }
        self.load_accumulator(value)
    }

    /// UNPK: the accumulator into 2L−1 zoned bytes at EA
    pub(super) fn unpack(&mut self, r: u8, ea: Address) -> Result<(), Trap> {
        let result = self.unpack_zoned(operand_length(r) * 2 - 1, ea);
        self.settle_decimal(result)
    }

    fn unpack_zoned(&mut self, digits: usize, ea: Address) -> Result<(), DecimalError> {
        let value = self.accumulator()?;
        if value.abs() >= limit(digits) {
            return Err(DecimalFault::Overflow.into());
        }

        let mut magnitude = value.unsigned_abs();
        let mut zoned = vec![ZONE; digits];
        for byte in zoned.iter_mut().rev() {
            *byte = ZONE | (magnitude % 10) as u8;
            magnitude /= 10;
        }
        if value < 0 {
            if let Some(last) = zoned.last_mut() {
                *last = MINUS_ZONE | (*last & 0xF);
            }
        }

        self.write_field(ea, &zoned)?;
        self.finish_decimal(value);
        Ok(())
    }

    /// DSA: shift the accumulator by the signed count in the low halfword of
    /// the effective word address, left being positive
    pub(super) fn decimal_shift(&mut self, word: Address) -> Result<(), Trap> {
        let result = self.shift_accumulator(i32::from(word as u16 as i16));
        self.settle_decimal(result)
    }

    fn shift_accumulator(&mut self, count: i32) -> Result<(), DecimalError> {
        let value = self.accumulator()?;
        let factor = 10i128.checked_pow(count.unsigned_abs());

        let shifted = match factor {
            _ if value == 0 => 0,
            Some(factor) if count < 0 => value / factor,
            None if count < 0 => 0,
            Some(factor) => value.checked_mul(factor).ok_or(DecimalFault::Overflow)?,
            None => return Err(DecimalFault::Overflow.into()),
        };
        self.load_accumulator(shifted)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::super::tests::computer_with;
    use super::*;

    #[test]
    fn packed_test() {
        assert_eq!(from_packed(&[0x12, 0x3C]), Ok(123));
        assert_eq!(from_packed(&[0x12, 0x3D]), Ok(-123));
        assert_eq!(from_packed(&[0x1A, 0x3C]), Err(DecimalFault::IllegalDigit));
        assert_eq!(from_packed(&[0x12, 0x34]), Err(DecimalFault::IllegalDigit));
        assert_eq!(to_packed(-123, 3), Ok(vec![0x00, 0x12, 0x3D]));
        assert_eq!(to_packed(1000, 2), Err(DecimalFault::Overflow));
    }

    #[test]
    fn arithmetic_test() {
        let mut computer = computer_with(indoc! {"
            DL,2    X'400'
            DA,2    X'401'
            DM,2    X'401'
            DS,2    X'400'
            DST,3   X'402'
        "});
        computer.memory().write_bytes(0x1000, &[0x12, 0x3C]).unwrap();
        computer.memory().write_bytes(0x1004, &[0x00, 0x2D]).unwrap();

        computer.run(1);
        assert_eq!(computer.accumulator(), Ok(123));
        assert_eq!(computer.reg(15), 0x0000_123C);
        assert_eq!(computer.psd.cc, ConditionCode::CC3);

        computer.run(1);
        assert_eq!(computer.accumulator(), Ok(121));

        computer.run(1);
        assert_eq!(computer.accumulator(), Ok(-242));
        assert_eq!(computer.psd.cc, ConditionCode::CC4);

        computer.run(1);
        assert_eq!(computer.accumulator(), Ok(-365));

        computer.run(1);
        let mut stored = [0; 3];
        computer.memory().read_bytes(0x1008, &mut stored).unwrap();
        assert_eq!(stored, [0x00, 0x36, 0x5D]);
    }

    #[test]
    fn divide_compare_test() {
        let mut computer = computer_with(indoc! {"
            DD,1    X'400'
            DC,1    X'400'
        "});
        computer.memory().write_bytes(0x1000, &[0x7C]).unwrap();
        computer.set_reg(15, 0x0000_100C);

        computer.run(1);
        // 100 / 7
        assert_eq!(computer.reg(15), 0x0000_014C);
        assert_eq!(computer.reg(13), 0x0000_002C);

        // Drop the remainder so the accumulator holds the quotient alone
        computer.set_reg(13, 0);
        computer.run(1);
        assert_eq!(computer.psd.cc, ConditionCode::CC3);
    }

    #[test]
    fn fault_test() {
        let mut computer = computer_with(indoc! {"
            DL,2    X'400'
            DD,1    X'401'
            DL,2    X'400'
        "});
        computer.memory().write_bytes(0x1000, &[0x1A, 0x3C]).unwrap();
        computer.memory().write_bytes(0x1004, &[0x0C]).unwrap();
        computer.set_reg(15, 0x0000_000C);

        computer.run(1);
        assert_eq!(computer.psd.cc, ConditionCode::CC1);

        computer.run(1);
        assert_eq!(computer.psd.cc, ConditionCode::CC2);

        computer.psd.mode |= Mode::DECIMAL_TRAP;
        computer.cycle();
        assert_eq!(
            computer.pending_trap().map(|t| t.trap),
            Some(Trap::Decimal(ConditionCode::CC1))
        );
    }

    #[test]
    fn zoned_test() {
        let mut computer = computer_with(indoc! {"
            PACK,2  X'400'
            UNPK,3  X'401'
        "});
        computer.memory().write_bytes(0x1000, &[0xF4, 0xF5, 0xD6]).unwrap();

        computer.run(1);
        assert_eq!(computer.accumulator(), Ok(-456));

        computer.run(1);
        let mut zoned = [0; 5];
        computer.memory().read_bytes(0x1004, &mut zoned).unwrap();
        assert_eq!(zoned, [0xF0, 0xF0, 0xF4, 0xF5, 0xD6]);
    }

    #[test]
    fn shift_test() {
        let mut computer = computer_with(indoc! {"
            DSA     2
            DSA     X'1FFFF'
        "});
        computer.set_reg(15, 0x0000_123C);

        computer.run(1);
        assert_eq!(computer.accumulator(), Ok(12300));

        computer.run(1);
        assert_eq!(computer.accumulator(), Ok(1230));
    }
}
