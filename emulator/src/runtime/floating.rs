//! Hexadecimal floating point.
//!
//! A number is a sign bit, a 7-bit excess-64 characteristic and a fraction of
//! 6 (short) or 14 (long) hexadecimal digits. Negative numbers are the two's
//! complement of the whole word or doubleword.

use tracing::trace;

use super::{Computer, ConditionCode, FloatMode, Trap};
use crate::codec::Opcode;
use crate::constants::{Address, Doubleword, Word};

/// Extra low-order bits carried through intermediate results
const GUARD_BITS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precision {
    Short,
    Long,
}

impl Precision {
    const fn bits(self) -> u32 {
        match self {
            Self::Short => 32,
            Self::Long => 64,
        }
    }

    const fn mask(self) -> u64 {
        match self {
            Self::Short => 0xFFFF_FFFF,
            Self::Long => u64::MAX,
        }
    }

    /// Width of a fraction including the guard bits
    const fn top(self) -> u32 {
        self.bits() - 8 + GUARD_BITS
    }
}

/// Characteristic out of range when packing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FloatFault {
    Overflow,
    Underflow,
}

/// An unpacked number; `fraction` is scaled by `2^top` so that a normalized
/// fraction lies in `[2^(top-4), 2^top)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Float {
    negative: bool,
    exponent: i32,
    fraction: u128,
}

impl Float {
    fn unpack(value: u64, precision: Precision) -> Self {
        let bits = precision.bits();
        let value = value & precision.mask();
        let negative = (value >> (bits - 1)) & 1 == 1;
        let magnitude = if negative {
            value.wrapping_neg() & precision.mask()
        } else {
            value
        };
        let characteristic = (magnitude >> (bits - 8)) & 0x7F;
        let fraction = magnitude & (precision.mask() >> 8);

        Self {
            negative,
            exponent: characteristic as i32 - 64,
            fraction: u128::from(fraction) << GUARD_BITS,
        }
    }

    fn is_zero(&self) -> bool {
        self.fraction == 0
    }

    fn negate(self) -> Self {
        Self {
            negative: !self.negative,
            ..self
        }
    }

    /// Absorb a carry out of the fraction
    fn carry(&mut self, precision: Precision) {
        while self.fraction >> precision.top() != 0 {
            self.fraction >>= 4;
            self.exponent += 1;
        }
    }

    /// Shift out leading zero digits, returning how many there were
    fn normalize(&mut self, precision: Precision) -> u32 {
        self.carry(precision);
        let mut shifts = 0;
        if self.is_zero() {
            return 0;
        }
        while self.fraction >> (precision.top() - 4) == 0 {
            self.fraction <<= 4;
            self.exponent -= 1;
            shifts += 1;
        }
        shifts
    }

    fn pack(self, precision: Precision) -> Result<u64, FloatFault> {
        let fraction = (self.fraction >> GUARD_BITS) as u64;
        if fraction == 0 {
            return Ok(0);
        }

        let characteristic = self.exponent + 64;
        if characteristic > 0x7F {
            return Err(FloatFault::Overflow);
        }
        if characteristic < 0 {
            return Err(FloatFault::Underflow);
        }

        let magnitude = ((characteristic as u64) << (precision.bits() - 8)) | fraction;
        Ok(if self.negative {
            magnitude.wrapping_neg() & precision.mask()
        } else {
            magnitude
        })
    }
}

/// An arithmetic result before packing
struct Outcome {
    value: Float,
    /// More than two digits of post-normalization
    significance: bool,
}

impl Outcome {
    const fn exact(value: Float) -> Self {
        Self {
            value,
            significance: false,
        }
    }
}

fn add(a: Float, b: Float, precision: Precision, normalize: bool) -> Outcome {
    let (high, low) = if a.exponent >= b.exponent { (a, b) } else { (b, a) };
    let shift = ((high.exponent - low.exponent) * 4) as u32;
    let aligned = if shift >= 128 { 0 } else { low.fraction >> shift };

    let signed = |negative: bool, fraction: u128| {
        if negative {
            -(fraction as i128)
        } else {
            fraction as i128
        }
    };
    let sum = signed(high.negative, high.fraction) + signed(low.negative, aligned);

    let mut value = Float {
        negative: sum < 0,
        exponent: high.exponent,
        fraction: sum.unsigned_abs(),
    };
    value.carry(precision);
    let significance = normalize && value.normalize(precision) > 2;
    Outcome { value, significance }
}

fn multiply(mut a: Float, mut b: Float, precision: Precision) -> Float {
    if a.is_zero() || b.is_zero() {
        return Float {
            negative: false,
            exponent: 0,
            fraction: 0,
        };
    }
    a.normalize(precision);
    b.normalize(precision);

    let mut value = Float {
        negative: a.negative != b.negative,
        exponent: a.exponent + b.exponent,
        fraction: (a.fraction * b.fraction) >> precision.top(),
    };
    value.normalize(precision);
    value
}

/// `None` on division by zero
fn divide(mut a: Float, mut b: Float, precision: Precision) -> Option<Float> {
    if b.is_zero() {
        return None;
    }
    if a.is_zero() {
        return Some(a);
    }
    a.normalize(precision);
    b.normalize(precision);

    let mut value = Float {
        negative: a.negative != b.negative,
        exponent: a.exponent - b.exponent,
        fraction: (a.fraction << precision.top()) / b.fraction,
    };
    value.normalize(precision);
    Some(value)
}

fn sign_cc(negative: bool) -> ConditionCode {
    if negative {
        ConditionCode::CC4
    } else {
        ConditionCode::CC3
    }
}

impl Computer {
    /// FAS, FSS, FMS, FDS and their long forms
    pub(super) fn floating(&mut self, op: Opcode, r: u8, ea: Address) -> Result<(), Trap> {
        use Opcode::{Fal, Fas, Fdl, Fds, Fml, Fms, Fsl, Fss};

        let precision = if matches!(op, Fal | Fsl | Fml | Fdl) {
            Precision::Long
        } else {
            Precision::Short
        };
        let (register, operand) = match precision {
            Precision::Long => (self.reg_pair(r), self.read_doubleword(ea)?),
            Precision::Short => (u64::from(self.reg(r)), u64::from(self.read_word(ea)?)),
        };

        let a = Float::unpack(register, precision);
        let b = Float::unpack(operand, precision);
        let normalize = !self.psd.float.contains(FloatMode::NORMALIZE);

        let outcome = match op {
            Fal | Fas => add(a, b, precision, normalize),
            Fsl | Fss => add(a, b.negate(), precision, normalize),
            Fml | Fms => Outcome::exact(multiply(a, b, precision)),
            Fdl | Fds => match divide(a, b, precision) {
                Some(value) => Outcome::exact(value),
                None => {
                    trace!("Floating-point divide by zero");
                    return Err(Trap::Floating(ConditionCode::CC2 | sign_cc(a.negative)));
                }
            },
            _ => return Err(Trap::NonexistentInstruction),
        };

        let negative = outcome.value.negative && !outcome.value.is_zero();
        let result = match outcome.value.pack(precision) {
            Ok(packed) => packed,
            Err(FloatFault::Underflow) if !self.psd.float.contains(FloatMode::ZERO) => 0,
            Err(fault) => {
                trace!(?fault, "Floating-point characteristic out of range");
                let cc = match fault {
                    FloatFault::Underflow => ConditionCode::CC1 | ConditionCode::CC2,
                    FloatFault::Overflow => ConditionCode::CC2,
                };
                return Err(Trap::Floating(cc | sign_cc(negative)));
            }
        };
        if result != 0 && outcome.significance && self.psd.float.contains(FloatMode::SIGNIFICANCE) {
            return Err(Trap::Floating(ConditionCode::CC1 | sign_cc(negative)));
        }

        match precision {
            Precision::Long => self.set_reg_pair(r, result as Doubleword),
            Precision::Short => self.set_reg(r, result as Word),
        }
        self.psd.set_flags(false, false);
        self.psd.set_sign(if result == 0 {
            0
        } else if negative {
            -1
        } else {
            1
        });
        Ok(())
    }

    /// SF: scale the fraction by a signed count of hexadecimal digits, moving
    /// the characteristic to match. Left shifts stop once normalized.
    /// CC1 reports characteristic overflow and CC2 underflow; the register
    /// is then left unchanged.
    pub(super) fn shift_floating(&mut self, r: u8, word: u32) -> Result<(), Trap> {
        let precision = if (word >> 8) & 1 == 1 {
            Precision::Long
        } else {
            Precision::Short
        };
        let count = super::instructions::signed(u64::from(word & 0x7F), 7);

        let register = match precision {
            Precision::Long => self.reg_pair(r),
            Precision::Short => u64::from(self.reg(r)),
        };
        let mut value = Float::unpack(register, precision);

        if !value.is_zero() {
            if count >= 0 {
                for _ in 0..count {
                    if value.fraction >> (precision.top() - 4) != 0 {
                        break;
                    }
                    value.fraction <<= 4;
                    value.exponent -= 1;
                }
            } else {
                let digits = (-count) as u32;
                value.fraction = value.fraction.checked_shr(digits * 4).unwrap_or(0);
                value.exponent += digits as i32;
            }
        }

        let result = match value.pack(precision) {
            Ok(result) => result,
            Err(fault) => {
                let overflow = fault == FloatFault::Overflow;
                self.psd.set_flags(overflow, !overflow);
                return Ok(());
            }
        };

        match precision {
            Precision::Long => self.set_reg_pair(r, result),
            Precision::Short => self.set_reg(r, result as Word),
        }
        self.psd.set_flags(false, false);
        self.psd.set_sign(match (result, value.negative) {
            (0, _) => 0,
            (_, true) => -1,
            (_, false) => 1,
        });
        Ok(())
    }
}
