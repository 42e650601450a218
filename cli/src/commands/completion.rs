use std::fs::File;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{CommandFactory, Parser, ValueHint};
use clap_complete::{generate, Shell};
use tracing::info;

use crate::Opt;

#[derive(Parser, Debug)]
pub struct CompletionOpt {
    /// Shell to generate completions for
    #[arg(value_enum)]
    shell: Shell,

    /// Write the completions to a file instead of the standard output
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<Utf8PathBuf>,
}

impl CompletionOpt {
    pub fn exec(&self) -> anyhow::Result<()> {
        let mut command = Opt::command();
        let name = command.get_name().to_owned();

        match &self.output {
            Some(path) => {
                let mut file =
                    File::create(path).with_context(|| format!("could not create {path}"))?;
                generate(self.shell, &mut command, name, &mut file);
                info!(%path, shell = %self.shell, "Completions written");
            }
            None => generate(self.shell, &mut command, name, &mut std::io::stdout()),
        }

        Ok(())
    }
}
