//! Instruction word codec.
//!
//! An instruction is a single 32-bit word:
//!
//! ```text
//!  0 | 1     7 | 8   11 | 12  14 | 15                 31
//!  * | opcode  |   R    |   X    |  reference address
//! ```
//!
//! Immediate and byte-string instructions use bits 12–31 as one signed
//! 20-bit value instead of the X and reference fields.

mod opcode;
pub mod parse;

use crate::constants::{Address, Word};

pub use self::opcode::{Feature, Opcode, OperandClass};
pub use self::parse::{parse, parse_instruction, ParseError};

/// The decoded fields of an instruction word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fields {
    pub indirect: bool,

    /// 7-bit operation code
    pub code: u8,

    /// Register designator
    pub r: u8,

    /// Index register, 0 for none
    pub x: u8,

    /// 17-bit reference address
    pub reference: Address,
}

impl Fields {
    /// Fields of an immediate or byte-string instruction, splitting a signed
    /// 20-bit value over the X and reference fields
    #[must_use]
    pub const fn with_value(code: u8, r: u8, value: i32) -> Self {
        let raw = (value as Word) & 0xF_FFFF;
        Self {
            indirect: false,
            code,
            r,
            x: (raw >> 17) as u8,
            reference: raw & 0x1_FFFF,
        }
    }
}

/// Split a word into its instruction fields
#[must_use]
pub const fn decode(word: Word) -> Fields {
    Fields {
        indirect: word & 0x8000_0000 != 0,
        code: ((word >> 24) & 0x7F) as u8,
        r: ((word >> 20) & 0xF) as u8,
        x: ((word >> 17) & 0x7) as u8,
        reference: word & 0x1_FFFF,
    }
}

/// Assemble instruction fields into a word, truncating oversized fields
#[must_use]
pub const fn encode(fields: &Fields) -> Word {
    let indirect = if fields.indirect { 0x8000_0000 } else { 0 };
    indirect
        | ((fields.code as Word & 0x7F) << 24)
        | ((fields.r as Word & 0xF) << 20)
        | ((fields.x as Word & 0x7) << 17)
        | (fields.reference & 0x1_FFFF)
}

/// An instruction word, with accessors for every field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction(pub Word);

impl Instruction {
    #[must_use]
    pub const fn indirect(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    #[must_use]
    pub const fn code(self) -> u8 {
        ((self.0 >> 24) & 0x7F) as u8
    }

    #[must_use]
    pub const fn r(self) -> u8 {
        ((self.0 >> 20) & 0xF) as u8
    }

    #[must_use]
    pub const fn x(self) -> u8 {
        ((self.0 >> 17) & 0x7) as u8
    }

    #[must_use]
    pub const fn reference(self) -> Address {
        self.0 & 0x1_FFFF
    }

    /// Bits 12–31 as a signed 20-bit value
    #[must_use]
    pub const fn value(self) -> i32 {
        ((self.0 << 12) as i32) >> 12
    }

    /// The R field as a signed 4-bit increment
    #[must_use]
    pub const fn delta(self) -> i32 {
        ((self.0 << 8) as i32) >> 28
    }

    /// The operation, if the word holds a defined instruction.
    ///
    /// Immediate and byte-string instructions with the indirect bit set are
    /// not defined.
    #[must_use]
    pub const fn opcode(self) -> Option<Opcode> {
        match Opcode::from_code(self.code()) {
            Some(op)
                if self.indirect()
                    && matches!(op.class(), OperandClass::Immediate | OperandClass::ByteString) =>
            {
                None
            }
            other => other,
        }
    }

    #[must_use]
    pub const fn fields(self) -> Fields {
        decode(self.0)
    }
}

impl From<Fields> for Instruction {
    fn from(fields: Fields) -> Self {
        Self(encode(&fields))
    }
}

impl From<Instruction> for Word {
    fn from(instruction: Instruction) -> Self {
        instruction.0
    }
}

/// Fixed-width disassembly
impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Some(op) = self.opcode() else {
            return write!(f, "{:<8}X'{:08X}'", "DATA", self.0);
        };

        let head = format!("{op},{}", self.r());
        write!(f, "{head:<8}")?;

        match op.class() {
            OperandClass::Immediate | OperandClass::ByteString => write!(f, "{}", self.value()),
            _ => {
                if self.indirect() {
                    write!(f, "*")?;
                }
                write!(f, "X'{:X}'", self.reference())?;
                if self.x() != 0 {
                    write!(f, ",{}", self.x())?;
                }
                Ok(())
            }
        }
    }
}

/// Render a word as fixed-width disassembly text
#[must_use]
pub fn render(word: Word) -> String {
    Instruction(word).to_string()
}
