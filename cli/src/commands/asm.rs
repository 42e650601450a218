use std::io::Write;

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use clap::{Parser, ValueHint};
use miette::NamedSource;
use sigma_emulator::constants::Word;
use sigma_emulator::{parse_instruction, Instruction};
use tracing::{debug, info};

#[derive(Parser, Debug)]
pub struct AsmOpt {
    /// Listing with one instruction per line. Blank lines and lines starting
    /// with `;` are skipped
    #[arg(value_hint = ValueHint::FilePath)]
    input: Utf8PathBuf,

    /// Write a memory image instead of printing the words
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<Utf8PathBuf>,
}

impl AsmOpt {
    pub fn exec(self) -> anyhow::Result<()> {
        info!(path = %self.input, "Reading listing");
        let listing = std::fs::read_to_string(&self.input)
            .with_context(|| format!("could not read {}", self.input))?;

        let mut words: Vec<Word> = Vec::new();
        let mut errors = 0;
        for (number, line) in listing.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with(';') {
                continue;
            }

            match parse_instruction(line) {
                Ok(instruction) => words.push(instruction.into()),
                Err(error) => {
                    errors += 1;
                    let name = format!("{}:{}", self.input, number + 1);
                    let report = miette::Report::new(error)
                        .with_source_code(NamedSource::new(name, line.to_owned()));
                    eprintln!("{report:?}");
                }
            }
        }

        if errors > 0 {
            bail!("{errors} lines could not be assembled");
        }
        debug!(words = words.len(), "Listing assembled");

        if let Some(output) = &self.output {
            let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_be_bytes()).collect();
            std::fs::write(output, bytes).with_context(|| format!("could not write {output}"))?;
            info!(path = %output, words = words.len(), "Image written");
        } else {
            let mut stdout = std::io::stdout().lock();
            for word in words {
                writeln!(stdout, "{word:08X}  {}", Instruction(word))?;
            }
        }

        Ok(())
    }
}
