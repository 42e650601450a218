//! This module implements the TTY monitor.
//!
//! It is mainly based on two crates:
//!   - rustyline, to handle the line-editting logic
//!   - clap, to handle the parsing of those interactive commands
//!
//! The processor keeps running on its own thread while the monitor waits for
//! input; halts are reported before each prompt.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use rustyline::history::DefaultHistory;
use rustyline::{Behavior, CompletionType, Config, EditMode, Editor};
use sigma_emulator::constants::{self as C, Address, Word};
use sigma_emulator::runtime::{
    AddressBreakpoint, BreakAction, BreakMode, LevelState, StepMode, Width,
};
use sigma_emulator::{HaltEvent, Instruction, Machine};
use tracing::{debug, info, warn};

use crate::parse::{Argument, AssignmentTarget};

mod helper;
use self::helper::MonitorHelper;

static HELP: &str = r#"
Run "help [command]" for command-specific help.
An empty line re-runs the last valid command.
Addresses are word addresses: X'1F0', 0x1F0, 496, R5 or R5+X'10'."#;

/// How long `step` and `branch` wait for the processor to halt
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Clone, Debug)]
#[command(
    help_template = "{about}\n\nCOMMANDS:\n{subcommands}\n{after-help}",
    after_help = HELP,
    disable_version_flag = true,
    infer_subcommands = true,
    no_binary_name = true,
    allow_negative_numbers = true,
)]
/// Monitor commands
enum Command {
    /// Execute the next instructions
    #[command(alias = "s")]
    Step {
        /// Number of instructions to execute
        #[arg(default_value = "1")]
        number: u64,
    },

    /// Run until a branch instruction is taken or falls through
    Branch {
        #[arg(value_enum)]
        outcome: BranchOutcome,
    },

    /// Let the processor run in the background
    #[command(alias = "c")]
    Continue,

    /// Stop the processor
    Stop,

    /// Show the program status doubleword
    Psd,

    /// Show the current register block
    Registers {
        #[arg(value_parser = clap::value_parser!(u8).range(0..16))]
        register: Option<u8>,
    },

    /// Show the content of a block in memory
    Memory {
        /// The word address to show. Can be a number, a register or a register
        /// with an offset
        address: Argument,

        /// Number of cells to show
        #[arg(default_value = "1")]
        number: u32,

        /// Size of the cells
        #[arg(short, long, value_enum, default_value = "word")]
        width: CellWidth,

        /// Translate the address through the memory map
        #[arg(long)]
        mapped: bool,
    },

    /// Set a word in memory or a register
    Set {
        /// The word address or register (R0 to R15) to set
        target: AssignmentTarget,

        /// The value to set
        value: Argument,

        /// Translate the address through the memory map
        #[arg(long)]
        mapped: bool,
    },

    /// Set an address breakpoint
    Break {
        /// The word address where to set the breakpoint
        address: Argument,

        /// Last word address of a range
        #[arg(long)]
        end: Option<Argument>,

        /// Break on operand reads
        #[arg(long)]
        read: bool,

        /// Break on operand writes
        #[arg(long)]
        write: bool,

        /// Only break on fetches arriving from outside the range
        #[arg(long)]
        transition: bool,

        /// Only break on mapped references
        #[arg(long, conflicts_with = "unmapped")]
        mapped: bool,

        /// Only break on unmapped references
        #[arg(long)]
        unmapped: bool,

        /// Log this many hits before halting
        #[arg(long)]
        log: Option<u32>,
    },

    /// Remove a breakpoint
    Unbreak {
        /// The slot of the breakpoint to remove
        slot: usize,
    },

    /// Halt when a trap or interrupt goes through a vector. Without a vector,
    /// clear it
    Catch { vector: Option<Argument> },

    /// Post an interrupt on a level
    Interrupt {
        #[arg(value_parser = clap::value_parser!(u8).range(0..32))]
        level: u8,
    },

    /// Show the next few instructions
    List {
        /// Number of instructions to show
        #[arg(default_value = "10")]
        number: u32,
    },

    /// Show counters, breakpoints and interrupt levels
    Status,

    /// Reset the processor, keeping memory
    Reset,

    /// Exit the emulator
    Exit,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BranchOutcome {
    Taken,
    NotTaken,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CellWidth {
    Byte,
    Half,
    Word,
    Doubleword,
}

impl From<CellWidth> for Width {
    fn from(width: CellWidth) -> Self {
        match width {
            CellWidth::Byte => Width::Byte,
            CellWidth::Half => Width::Half,
            CellWidth::Word => Width::Word,
            CellWidth::Doubleword => Width::Doubleword,
        }
    }
}

/// Holds informations about a monitor session
#[derive(Debug, Default)]
struct Session {
    /// Current address for the `list` command
    list_address: Option<Address>,
}

impl Session {
    /// Reset the `list` command (after running an instruction)
    fn reset_list(&mut self) {
        self.list_address = None;
    }

    /// Offset the `list` command, returns the address to show
    fn offset_list(&mut self, ia: Address, offset: Address) -> Address {
        let address = self.list_address.unwrap_or(ia);
        self.list_address = Some((address + offset) & C::ADDRESS_MASK);
        address
    }
}

/// Log every halt event sent since the last prompt
fn drain_events(machine: &Machine) {
    while let Ok(event) = machine.halt_events().try_recv() {
        report(&event);
    }
}

fn report(event: &HaltEvent) {
    match event {
        HaltEvent::Halted { reason, psd } => info!(ia = psd.ia, "Halted: {reason}"),
        HaltEvent::Stopped { psd } => info!(ia = psd.ia, "Stopped"),
        HaltEvent::Exited => warn!("Processor thread exited"),
    }
}

/// Wait for a step to finish
fn wait_for_step(machine: &Machine) {
    match machine.wait_for_halt(STEP_TIMEOUT) {
        Some(event) => report(&event),
        None => warn!("Still running after {STEP_TIMEOUT:?}, use \"stop\" to halt"),
    }
}

/// Display an instruction at a word address
fn display_instruction(
    machine: &Machine,
    address: Address,
    ia: Address,
    mapped: bool,
    breaks: bool,
) {
    let gutter = match (breaks, ia == address) {
        (true, true) => "B>",
        (true, false) => "B ",
        (false, true) => " >",
        (false, false) => "  ",
    };

    match machine.peek(Width::Word, address * C::WORD_BYTES, mapped) {
        Ok(word) => {
            let word = word as Word;
            info!("{gutter:<2} {address:05X}  {word:08X}  {}", Instruction(word));
        }
        Err(_) => info!("{gutter:<2} {address:05X}  –"),
    }
}

/// `X'1F0'` for a word address, `X'1F0'+2` for a byte within it
fn location(byte: Address) -> String {
    match byte % C::WORD_BYTES {
        0 => format!("X'{:05X}'", byte / C::WORD_BYTES),
        offset => format!("X'{:05X}'+{offset}", byte / C::WORD_BYTES),
    }
}

/// Display the breakpoint slots
fn display_breakpoints(machine: &Machine) -> anyhow::Result<()> {
    let slots = machine.with_computer(|computer| computer.breakpoints.clone())?;
    let mut any = false;
    for (slot, breakpoint) in slots.address.iter().enumerate() {
        if let Some(breakpoint) = breakpoint {
            any = true;
            info!(
                slot,
                mode = ?breakpoint.mode,
                action = ?breakpoint.action,
                "Breakpoint X'{:05X}'..=X'{:05X}'",
                breakpoint.start,
                breakpoint.end
            );
        }
    }
    if let Some(vector) = slots.trap {
        any = true;
        info!("Catching vector X'{vector:X}'");
    }
    if !any {
        info!("No breakpoints");
    }
    Ok(())
}

fn display_status(machine: &Machine) -> anyhow::Result<()> {
    let status = machine.status();
    if status.stale {
        warn!("The processor is busy, this status is stale");
    }

    info!(
        running = status.running,
        waiting = status.waiting,
        instructions = status.instructions,
        traps = status.traps,
        interrupts = status.interrupts,
        waits = status.waits,
        wait_time = ?status.wait_time,
        "Status"
    );
    if let Some((address, instruction)) = status.last_instruction {
        info!("Last instruction: X'{address:05X}'  {instruction}");
    }
    if let Some(halt) = &status.halt {
        info!("Last halt: {halt}");
    }
    if let Some(fault) = &status.fault {
        warn!("Fault latched: {fault}. Use \"reset\" to clear it");
    }

    for (level, state) in machine.interrupt_levels().iter().enumerate() {
        if state.state != LevelState::Disarmed {
            info!(
                level,
                state = ?state.state,
                enabled = state.enabled,
                count = state.count,
                "Interrupt level"
            );
        }
    }

    display_breakpoints(machine)
}

fn display_registers(registers: &[Word; C::REGISTERS], register: Option<u8>) {
    if let Some(r) = register {
        info!("R{r} = {:08X}", registers[usize::from(r)]);
        return;
    }

    for (row, chunk) in registers.chunks(4).enumerate() {
        let line: Vec<String> = chunk
            .iter()
            .enumerate()
            .map(|(column, value)| format!("R{:<2} {value:08X}", row * 4 + column))
            .collect();
        info!("{}", line.join("  "));
    }
}

#[allow(clippy::too_many_lines)]
pub(crate) fn run_interactive(machine: &Machine) -> anyhow::Result<()> {
    info!("Running in interactive mode. Type \"help\" to list available commands.");
    let config = Config::builder()
        .history_ignore_space(true)
        .completion_type(CompletionType::List)
        .edit_mode(EditMode::Emacs)
        .behavior(Behavior::PreferTerm)
        .auto_add_history(true)
        .build();

    let mut session = Session::default();

    let mut rl: Editor<MonitorHelper<Command>, DefaultHistory> = Editor::with_config(config)?;
    rl.set_helper(Some(MonitorHelper::new()));

    let mut last_command: Option<Command> = None;

    'read: loop {
        // A macro to unwrap an error, log it and continue the loop
        macro_rules! warn_and_continue {
            ($e:expr) => {
                match $e {
                    Ok(o) => o,
                    Err(e) => {
                        tracing::warn!(error = %e);
                        continue 'read;
                    }
                }
            };
        }

        drain_events(machine);

        let Ok(readline) = rl.readline(">> ") else {
            info!("EOF, exiting");
            break;
        };

        let command = if readline.trim().is_empty() {
            if let Some(command) = &last_command {
                command.clone()
            } else {
                info!("Type \"help\" to get the list of available commands");
                continue 'read;
            }
        } else {
            let Ok(words) = shell_words::split(readline.as_str()) else {
                warn!("Invalid input");
                continue 'read;
            };

            let command = match Command::try_parse_from(words) {
                Ok(command) => command,
                Err(e) => {
                    // Help and usage errors print themselves
                    let _ = e.print();
                    continue 'read;
                }
            };
            last_command = Some(command.clone());
            command
        };

        debug!("Executing command: {:?}", command);

        let running = machine.is_running();
        match command {
            Command::Exit => break,

            Command::Step { .. } | Command::Branch { .. } | Command::Continue if running => {
                warn!("The processor is running. Use \"stop\" first");
            }

            Command::Step { number } => {
                session.reset_list();
                warn_and_continue!(machine.step(number));
                wait_for_step(machine);
            }

            Command::Branch { outcome } => {
                session.reset_list();
                warn_and_continue!(
                    machine.step_until_branch(matches!(outcome, BranchOutcome::Taken))
                );
                wait_for_step(machine);
            }

            Command::Continue => {
                session.reset_list();
                warn_and_continue!(machine.with_computer(|computer| {
                    computer.set_step_mode(StepMode::Run);
                }));
                machine.start();
                info!("Running. Use \"stop\" to halt");
            }

            Command::Stop => {
                if running {
                    machine.stop();
                    if let Some(event) = machine.wait_for_halt(STEP_TIMEOUT) {
                        report(&event);
                    }
                } else {
                    info!("The processor is not running");
                }
            }

            Command::Psd => {
                let status = machine.status();
                info!("PSD {}", status.psd);
            }

            Command::Registers { register } => {
                let status = machine.status();
                info!("Register block {}", status.psd.rp);
                display_registers(&status.registers, register);
            }

            Command::Memory {
                address,
                number,
                width,
                mapped,
            } => {
                let width = Width::from(width);
                let start = warn_and_continue!(address.address(machine)) * C::WORD_BYTES;
                let digits = 2 * width.bytes() as usize;
                for index in 0..number {
                    let byte = start + index * width.bytes();
                    let value = warn_and_continue!(machine.peek(width, byte, mapped));
                    info!("{}  {value:0digits$X}", location(byte));
                }
            }

            Command::Set {
                target,
                value,
                mapped,
            } => {
                let value = warn_and_continue!(value.evaluate(machine));
                match target {
                    AssignmentTarget::Register(r) => {
                        info!("Setting R{r} to X'{value:08X}'");
                        warn_and_continue!(
                            machine.with_computer(|computer| computer.set_reg(r, value))
                        );
                    }
                    AssignmentTarget::Address(address) => {
                        info!("Setting memory at X'{address:05X}' to X'{value:08X}'");
                        warn_and_continue!(machine.poke(
                            Width::Word,
                            address * C::WORD_BYTES,
                            value.into(),
                            mapped
                        ));
                    }
                }
            }

            Command::Break {
                address,
                end,
                read,
                write,
                transition,
                mapped,
                unmapped,
                log,
            } => {
                let start = warn_and_continue!(address.address(machine));
                let end = match end {
                    Some(end) => warn_and_continue!(end.address(machine)),
                    None => start,
                };

                let mut mode = BreakMode::empty();
                if read {
                    mode |= BreakMode::READ;
                }
                if write {
                    mode |= BreakMode::WRITE;
                }
                if !(read || write) {
                    mode |= BreakMode::EXECUTE;
                }
                if transition {
                    mode |= BreakMode::TRANSITION;
                }
                mode |= match (mapped, unmapped) {
                    (true, false) => BreakMode::MAPPED,
                    (false, true) => BreakMode::UNMAPPED,
                    _ => BreakMode::MAPPED | BreakMode::UNMAPPED,
                };

                let breakpoint = AddressBreakpoint {
                    start: start.min(end),
                    end: start.max(end),
                    mode,
                    context: None,
                    action: log.map_or(BreakAction::Halt, BreakAction::Log),
                };
                let slot = warn_and_continue!(machine.add_breakpoint(breakpoint));
                info!(slot, "Breakpoint set at X'{start:05X}'");
            }

            Command::Unbreak { slot } => {
                match warn_and_continue!(machine.remove_breakpoint(slot)) {
                    Some(breakpoint) => {
                        info!(slot, "Removed breakpoint at X'{:05X}'", breakpoint.start);
                    }
                    None => warn!(slot, "No breakpoint in this slot"),
                }
            }

            Command::Catch { vector } => {
                let vector = match vector {
                    Some(vector) => Some(warn_and_continue!(vector.address(machine))),
                    None => None,
                };
                warn_and_continue!(machine.set_trap_breakpoint(vector));
                match vector {
                    Some(vector) => info!("Catching vector X'{vector:X}'"),
                    None => info!("No longer catching traps"),
                }
            }

            Command::Interrupt { level } => {
                if machine.trigger(level) {
                    info!(level, "Interrupt posted");
                } else {
                    warn!(level, "Interrupt dropped, the level is disarmed or already waiting");
                }
            }

            Command::List { number } => {
                let status = machine.status();
                let mapped = status.psd.is_mapped();
                let breakpoints = warn_and_continue!(
                    machine.with_computer(|computer| computer.breakpoints.address)
                );

                let first = session.offset_list(status.psd.ia, number);
                for offset in 0..number {
                    let address = (first + offset) & C::ADDRESS_MASK;
                    let breaks = breakpoints.iter().flatten().any(|breakpoint| {
                        breakpoint.mode.contains(BreakMode::EXECUTE)
                            && (breakpoint.start..=breakpoint.end).contains(&address)
                    });
                    display_instruction(machine, address, status.psd.ia, mapped, breaks);
                }
            }

            Command::Status => {
                warn_and_continue!(display_status(machine));
            }

            Command::Reset => {
                session.reset_list();
                warn_and_continue!(machine.reset());
                info!("Processor reset");
            }
        }
    }

    if machine.is_running() {
        machine.stop();
    }
    Ok(())
}
