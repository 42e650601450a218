use clap::Parser;

mod asm;
mod completion;
mod disasm;
mod run;

#[derive(Parser, Debug)]
pub enum Subcommand {
    /// Load a memory image and run it
    Run(self::run::RunOpt),

    /// Disassemble a memory image
    Disasm(self::disasm::DisasmOpt),

    /// Assemble a listing of one instruction per line
    Asm(self::asm::AsmOpt),

    /// Generate shell completions
    Completion(self::completion::CompletionOpt),
}

impl Subcommand {
    /// Run a subcommand
    pub fn exec(self) -> anyhow::Result<()> {
        match self {
            Self::Run(opt) => opt.exec(),
            Self::Disasm(opt) => opt.exec(),
            Self::Asm(opt) => opt.exec(),
            Self::Completion(opt) => opt.exec(),
        }
    }
}
