use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, ValueHint};
use sigma_emulator::constants::Address;
use sigma_emulator::image::read_image;
use sigma_emulator::Instruction;
use tracing::info;

use crate::parse::parse_address;

#[derive(Parser, Debug)]
pub struct DisasmOpt {
    /// Memory image, a file of big-endian words
    #[arg(value_hint = ValueHint::FilePath)]
    input: Utf8PathBuf,

    /// Word address of the first word in the image
    #[arg(short, long, value_parser = parse_address, default_value = "0")]
    origin: Address,

    /// Words to skip at the start of the image
    #[arg(short, long, default_value_t = 0)]
    skip: usize,

    /// Number of words to show, to the end of the image by default
    #[arg(short = 'n', long)]
    count: Option<usize>,
}

impl DisasmOpt {
    pub fn exec(self) -> anyhow::Result<()> {
        info!(path = %self.input, "Reading image");
        let words = read_image(&self.input)
            .with_context(|| format!("could not disassemble {}", self.input))?;

        let count = self.count.unwrap_or(usize::MAX);
        for (index, &word) in words.iter().enumerate().skip(self.skip).take(count) {
            let address = self.origin + index as Address;
            println!("{address:05X}  {word:08X}  {}", Instruction(word));
        }

        Ok(())
    }
}
