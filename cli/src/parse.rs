//! Numbers, registers and addresses typed on the command line and in the monitor.

use std::str::FromStr;

use nom::branch::alt;
use nom::character::complete::{one_of, space0, u8 as decimal};
use nom::combinator::{all_consuming, map, verify};
use nom::sequence::{preceded, tuple};
use nom::{Finish, IResult};
use sigma_emulator::codec::parse::number;
use sigma_emulator::constants::{self as C, Address, Word};
use sigma_emulator::machine::MachineError;
use sigma_emulator::Machine;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("could not parse `{0}`: expected a number, a register (R5) or R5+offset")]
pub struct ParseArgumentError(String);

/// A value typed in the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argument {
    Literal(i64),

    /// The contents of a register of the current block
    Register(u8),

    /// A register plus a signed offset
    Indexed(u8, i64),
}

impl Argument {
    /// Resolve the argument against the current register block
    pub fn evaluate(self, machine: &Machine) -> Result<Word, MachineError> {
        let value = match self {
            Argument::Literal(value) => value as Word,
            Argument::Register(r) => machine.with_computer(|computer| computer.reg(r))?,
            Argument::Indexed(r, offset) => machine
                .with_computer(|computer| computer.reg(r))?
                .wrapping_add(offset as Word),
        };
        Ok(value)
    }

    /// Resolve the argument as a word address
    pub fn address(self, machine: &Machine) -> Result<Address, MachineError> {
        Ok(self.evaluate(machine)? & C::ADDRESS_MASK)
    }
}

impl FromStr for Argument {
    type Err = ParseArgumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        all_consuming(argument)(s.trim())
            .finish()
            .map(|(_, argument)| argument)
            .map_err(|_| ParseArgumentError(s.to_owned()))
    }
}

/// Where `set` writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentTarget {
    Register(u8),
    Address(Address),
}

impl FromStr for AssignmentTarget {
    type Err = ParseArgumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let target = alt((
            map(register, AssignmentTarget::Register),
            map(number, |address| AssignmentTarget::Address(address as Address & C::ADDRESS_MASK)),
        ));

        all_consuming(target)(s.trim())
            .finish()
            .map(|(_, target)| target)
            .map_err(|_| ParseArgumentError(s.to_owned()))
    }
}

/// `R0` to `R15`
fn register(input: &str) -> IResult<&str, u8> {
    preceded(
        one_of("rR"),
        verify(decimal, |&r: &u8| usize::from(r) < C::REGISTERS),
    )(input)
}

fn indexed(input: &str) -> IResult<&str, Argument> {
    map(
        tuple((register, space0, one_of("+-"), space0, number)),
        |(r, _, sign, _, offset)| {
            Argument::Indexed(r, if sign == '-' { -offset } else { offset })
        },
    )(input)
}

fn argument(input: &str) -> IResult<&str, Argument> {
    alt((
        indexed,
        map(register, Argument::Register),
        map(number, Argument::Literal),
    ))(input)
}

/// A hexadecimal or decimal number for `clap`
pub fn parse_word(text: &str) -> Result<Word, ParseArgumentError> {
    sigma_emulator::codec::parse::parse_number(text)
        .filter(|value| (-0x8000_0000..=0xFFFF_FFFF).contains(value))
        .map(|value| value as Word)
        .ok_or_else(|| ParseArgumentError(text.to_owned()))
}

/// A 17-bit word address for `clap`
pub fn parse_address(text: &str) -> Result<Address, ParseArgumentError> {
    sigma_emulator::codec::parse::parse_number(text)
        .filter(|value| (0..=i64::from(C::ADDRESS_MASK)).contains(value))
        .map(|value| value as Address)
        .ok_or_else(|| ParseArgumentError(text.to_owned()))
}

/// A device address for `clap`
pub fn parse_device(text: &str) -> Result<u16, ParseArgumentError> {
    sigma_emulator::codec::parse::parse_number(text)
        .and_then(|value| u16::try_from(value).ok())
        .filter(|&value| value < 0x800)
        .ok_or_else(|| ParseArgumentError(text.to_owned()))
}
