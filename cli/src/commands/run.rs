use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{ArgAction, Parser, ValueHint};
use sigma_emulator::codec::Feature;
use sigma_emulator::constants::{self as C, Address};
use sigma_emulator::runtime::NullIo;
use sigma_emulator::{load_image, HaltEvent, Machine, MachineConfig};
use tracing::{debug, info, warn};

use crate::interactive::run_interactive;
use crate::parse::{parse_address, parse_device};

#[derive(Parser, Debug)]
pub struct RunOpt {
    /// Memory image, a file of big-endian words
    #[arg(value_hint = ValueHint::FilePath)]
    input: Utf8PathBuf,

    /// Word address the image is loaded at
    #[arg(short, long, value_parser = parse_address, default_value = "X'100'")]
    load_address: Address,

    /// Word address to start at. Defaults to the load address
    #[arg(short, long, value_parser = parse_address, conflicts_with = "boot")]
    start: Option<Address>,

    /// Installed memory, in 512-word pages
    #[arg(short, long, default_value_t = C::DEFAULT_PAGES)]
    memory_pages: usize,

    /// Device the bootstrap reads from
    #[arg(long, value_parser = parse_device, default_value = "X'080'")]
    boot_device: u16,

    /// Start through the IPL bootstrap instead of a start address
    #[arg(short, long, action = ArgAction::SetTrue)]
    boot: bool,

    /// Leave out the optional floating-point instructions
    #[arg(long, action = ArgAction::SetTrue)]
    no_floating: bool,

    /// Leave out the optional decimal instructions
    #[arg(long, action = ArgAction::SetTrue)]
    no_decimal: bool,

    /// Run the program in interactive mode
    #[arg(short, long, action = ArgAction::SetTrue)]
    interactive: bool,
}

impl RunOpt {
    pub fn exec(self) -> anyhow::Result<()> {
        let mut config = MachineConfig::default()
            .with_memory_pages(self.memory_pages)
            .with_boot_device(self.boot_device);
        if self.no_floating {
            config = config.without(Feature::Floating);
        }
        if self.no_decimal {
            config = config.without(Feature::Decimal);
        }

        debug!(?config, "Powering on");
        let mut machine = Machine::power_on(config, Box::new(NullIo))?;

        info!(path = %self.input, origin = self.load_address, "Loading image");
        let words = load_image(machine.memory(), &self.input, self.load_address)
            .with_context(|| format!("could not load {}", self.input))?;
        debug!(words, "Image loaded");

        if self.boot {
            machine.boot()?;
        } else {
            machine.set_ia(self.start.unwrap_or(self.load_address))?;
        }

        if self.interactive {
            run_interactive(&machine)?;
        } else {
            info!("Running program");
            machine.start();
            match machine.halt_events().recv() {
                Ok(HaltEvent::Halted { reason, psd }) => info!(%reason, %psd, "Halted"),
                Ok(HaltEvent::Stopped { psd }) => info!(%psd, "Stopped"),
                Ok(HaltEvent::Exited) | Err(_) => warn!("Processor exited"),
            }
        }

        let status = machine.status();
        info!(
            instructions = status.instructions,
            traps = status.traps,
            interrupts = status.interrupts,
            "End of program"
        );

        machine.power_off()?;
        Ok(())
    }
}
