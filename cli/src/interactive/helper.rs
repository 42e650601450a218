use std::borrow::Cow;
use std::collections::BTreeSet;
use std::marker::PhantomData;

use anstyle::Style;
use clap::{Command, CommandFactory};
use rustyline::{
    completion::Completer,
    highlight::Highlighter,
    hint::Hinter,
    validate::{ValidationContext, ValidationResult, Validator},
    Context,
};
use rustyline_derive::Helper;

/// Rustyline helper, that handles interactive completion, highlighting and hinting.
#[derive(Helper, Debug)]
pub(crate) struct MonitorHelper<T: CommandFactory> {
    app: PhantomData<T>,
}

impl<T: CommandFactory> MonitorHelper<T> {
    pub fn new() -> Self {
        MonitorHelper { app: PhantomData }
    }
}

/// Values worth offering for a positional argument, by argument id
fn positional_values(id: &str) -> Vec<String> {
    match id {
        "register" | "target" | "address" => (0..16).map(|r| format!("R{r}")).collect(),
        _ => Vec::new(),
    }
}

/// Length of the word being completed and the candidates for it
fn suggest(command: &Command, input: &[String]) -> (usize, BTreeSet<String>) {
    match input {
        [] => (0, BTreeSet::new()),

        [last] => {
            let mut suggestions: BTreeSet<String> = command
                .get_subcommands()
                .flat_map(|cmd| {
                    std::iter::once(cmd.get_name().to_string())
                        .chain(cmd.get_visible_aliases().map(ToString::to_string))
                })
                .collect();

            // If the app has subcommands, it has a `help` command
            if command.has_subcommands() {
                suggestions.insert("help".to_string());
            }

            if last.starts_with('-') {
                suggestions.extend(
                    command
                        .get_arguments()
                        .filter_map(|arg| arg.get_long())
                        .map(|long| format!("--{long}")),
                );
            }

            for arg in command.get_positionals() {
                suggestions.extend(
                    arg.get_possible_values()
                        .iter()
                        .map(|value| value.get_name().to_string()),
                );
                suggestions.extend(positional_values(arg.get_id().as_str()));
            }

            let candidates = suggestions
                .into_iter()
                .filter(|candidate| candidate.starts_with(last.as_str()))
                .collect();
            (last.len(), candidates)
        }

        [head, tail @ ..] => command
            .find_subcommand(head)
            .map(|sub: &Command| suggest(sub, tail))
            .unwrap_or_default(),
    }
}

/// Split the line up to the cursor and find the candidates for its last word
fn candidates<T: CommandFactory>(line: &str, pos: usize) -> Option<(usize, BTreeSet<String>)> {
    let line = &line[..pos];
    let mut words = shell_words::split(line).ok()?;

    // A trailing blank starts a new word
    if line.ends_with([' ', '\t']) {
        words.push(String::new());
    }

    Some(suggest(&T::command(), words.as_slice()))
}

impl<T: CommandFactory> Completer for MonitorHelper<T> {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Self::Candidate>)> {
        Ok(candidates::<T>(line, pos).map_or((0, Vec::new()), |(offset, candidates)| {
            (pos - offset, candidates.into_iter().collect())
        }))
    }
}

impl<T: CommandFactory> Highlighter for MonitorHelper<T> {
    fn highlight_hint<'h>(&self, hint: &'h str) -> Cow<'h, str> {
        let style = Style::new().dimmed();
        Cow::Owned(format!("{}{hint}{}", style.render(), style.render_reset()))
    }

    fn highlight_prompt<'b, 's: 'b, 'p: 'b>(
        &'s self,
        prompt: &'p str,
        _default: bool,
    ) -> Cow<'b, str> {
        let style = Style::new().bold();
        Cow::Owned(format!("{}{prompt}{}", style.render(), style.render_reset()))
    }
}

impl<T: CommandFactory> Hinter for MonitorHelper<T> {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> Option<String> {
        let (offset, candidates) = candidates::<T>(line, pos)?;
        let mut candidates = candidates.into_iter();
        match (candidates.next(), candidates.next()) {
            (Some(only), None) => Some(only[offset..].to_string()),
            _ => None,
        }
    }
}

impl<T: CommandFactory> Validator for MonitorHelper<T> {
    fn validate(&self, ctx: &mut ValidationContext) -> rustyline::Result<ValidationResult> {
        if shell_words::split(ctx.input()).is_err() {
            Ok(ValidationResult::Incomplete)
        } else {
            Ok(ValidationResult::Valid(None))
        }
    }
}
