//! Parse instructions in the disassembler's syntax.
//!
//! ```text
//! LW,5    *X'1F0',2
//! LI,3    -12
//! DATA    X'0000002A'
//! ```
//!
//! Mnemonics are case-insensitive. Numbers are `X'hex'`, `0xhex` or decimal.
//! `B` is accepted as the unconditional branch `BCR,0`.

use miette::{Diagnostic, SourceSpan};
use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    character::complete::{alphanumeric1, char, digit1, hex_digit1, one_of, space0, space1},
    combinator::{all_consuming, map, map_res, opt},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use thiserror::Error;

use super::{Fields, Instruction, Opcode, OperandClass};
use crate::constants::Word;

#[derive(Debug, Error, Diagnostic, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid syntax")]
    Syntax {
        #[label("here")]
        span: SourceSpan,
    },

    #[error("unknown mnemonic `{mnemonic}`")]
    UnknownMnemonic {
        mnemonic: String,

        #[label("not an instruction")]
        span: SourceSpan,
    },

    #[error("{value} does not fit in the {field} field")]
    OutOfRange {
        field: &'static str,
        value: i64,

        #[label("out of range")]
        span: SourceSpan,
    },
}

impl ParseError {
    fn syntax(source: &str, rest: &str) -> Self {
        let offset = source.len() - rest.len();
        Self::Syntax {
            span: (offset, rest.len().max(1)).into(),
        }
    }
}

type Failure<'a> = nom::Err<nom::error::Error<&'a str>>;

fn hexadecimal(input: &str) -> IResult<&str, i64> {
    map_res(
        alt((
            delimited(tag_no_case("X'"), hex_digit1, char('\'')),
            preceded(tag_no_case("0x"), hex_digit1),
        )),
        |digits| i64::from_str_radix(digits, 16),
    )(input)
}

fn decimal(input: &str) -> IResult<&str, i64> {
    map_res(digit1, |digits: &str| digits.parse::<i64>())(input)
}

/// A literal with an optional sign
pub fn number(input: &str) -> IResult<&str, i64> {
    map(
        pair(opt(one_of("+-")), alt((hexadecimal, decimal))),
        |(sign, value)| if sign == Some('-') { -value } else { value },
    )(input)
}

/// Parse a whole string as a number literal
#[must_use]
pub fn parse_number(text: &str) -> Option<i64> {
    all_consuming(number)(text.trim())
        .ok()
        .map(|(_, value)| value)
}

/// `[*]reference[,index]`
fn reference(input: &str) -> IResult<&str, (bool, i64, Option<i64>)> {
    tuple((
        map(opt(char('*')), |star| star.is_some()),
        number,
        opt(preceded(char(','), number)),
    ))(input)
}

/// Check a parsed value against a field range, pointing at `at` on failure
fn field(
    source: &str,
    at: &str,
    name: &'static str,
    value: i64,
    range: &std::ops::RangeInclusive<i64>,
) -> Result<i64, ParseError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        let offset = source.len() - at.len();
        Err(ParseError::OutOfRange {
            field: name,
            value,
            span: (offset, at.len().max(1)).into(),
        })
    }
}

/// Parse one instruction, with a diagnostic on failure
///
/// # Errors
///
/// Returns an error if the text is not a single well-formed instruction.
pub fn parse_instruction(source: &str) -> Result<Instruction, ParseError> {
    let syntax = |rest: &str| ParseError::syntax(source, rest);

    let input = source.trim_start();
    let (rest, name) = alphanumeric1(input).map_err(|_: Failure<'_>| syntax(input))?;

    if name.eq_ignore_ascii_case("DATA") {
        let (rest, _) = space1(rest).map_err(|_: Failure<'_>| syntax(rest))?;
        let (tail, value) = number(rest).map_err(|_| syntax(rest))?;
        let value = field(source, rest, "word", value, &(-0x8000_0000..=0xFFFF_FFFF))?;
        if !tail.trim().is_empty() {
            return Err(syntax(tail));
        }
        return Ok(Instruction(value as Word));
    }

    let branch = name.eq_ignore_ascii_case("B");
    let op = if branch {
        Some(Opcode::Bcr)
    } else {
        Opcode::from_mnemonic(name)
    };
    let op = op.ok_or_else(|| ParseError::UnknownMnemonic {
        mnemonic: name.to_owned(),
        span: (source.len() - input.len(), name.len()).into(),
    })?;

    let r_at = rest;
    let (rest, r) =
        opt(preceded(char(','), number))(rest).map_err(|_: Failure<'_>| syntax(rest))?;
    let r = match r {
        Some(_) if branch => return Err(syntax(r_at)),
        Some(r) if op.has_delta() => field(source, r_at, "R", r, &(-8..=15))? & 0xF,
        Some(r) => field(source, r_at, "R", r, &(0..=15))?,
        None => 0,
    };

    let (operand, _) = space0(rest).map_err(|_: Failure<'_>| syntax(rest))?;

    let (tail, fields) = match op.class() {
        OperandClass::Immediate | OperandClass::ByteString => {
            let (tail, value) = opt(number)(operand).map_err(|_: Failure<'_>| syntax(operand))?;
            let range = -0x8_0000..=0x7_FFFF;
            let value = field(source, operand, "value", value.unwrap_or(0), &range)?;
            (tail, Fields::with_value(op.code(), r as u8, value as i32))
        }
        _ => {
            let (tail, operand_fields) =
                opt(reference)(operand).map_err(|_: Failure<'_>| syntax(operand))?;
            let (indirect, address, index) = operand_fields.unwrap_or((false, 0, None));
            let address = field(source, operand, "reference", address, &(0..=0x1_FFFF))?;
            let index = field(source, operand, "index", index.unwrap_or(0), &(0..=7))?;
            let fields = Fields {
                indirect,
                code: op.code(),
                r: r as u8,
                x: index as u8,
                reference: address as Word,
            };
            (tail, fields)
        }
    };

    if !tail.trim().is_empty() {
        return Err(syntax(tail));
    }

    Ok(Instruction::from(fields))
}

/// Parse one instruction, `None` if the text is malformed
#[must_use]
pub fn parse(text: &str) -> Option<Instruction> {
    parse_instruction(text).ok()
}
