//! Final command construction
//!
//! Turns a program, its arguments and an optional shell request into the
//! [`BuiltCommand`] handed to the OS. Platform differences live in
//! [`ShellStrategy`], selected once per build.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Platform family the command is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Posix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Posix
        }
    }
}

/// Whether (and through which program) to run the command via a shell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShellRequest {
    /// `true` runs through the platform's default shell
    Enabled(bool),
    /// Run through this shell program
    Program(String),
}

impl ShellRequest {
    pub fn is_enabled(&self) -> bool {
        match self {
            ShellRequest::Enabled(enabled) => *enabled,
            ShellRequest::Program(program) => !program.is_empty(),
        }
    }
}

impl Default for ShellRequest {
    fn default() -> Self {
        ShellRequest::Enabled(false)
    }
}

impl From<bool> for ShellRequest {
    fn from(enabled: bool) -> Self {
        ShellRequest::Enabled(enabled)
    }
}

impl From<&str> for ShellRequest {
    fn from(program: &str) -> Self {
        ShellRequest::Program(program.to_string())
    }
}

impl From<String> for ShellRequest {
    fn from(program: String) -> Self {
        ShellRequest::Program(program)
    }
}

/// Hook for rewriting arguments when the target program needs it
///
/// Used when a process spawns another instance of itself and flags have to
/// be translated so both behave the same way.
pub trait ArgTranslator: Send + Sync + fmt::Debug {
    fn translate(&self, program: &str, args: Vec<String>) -> Vec<String>;
}

/// Leaves arguments untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTranslation;

impl ArgTranslator for NoTranslation {
    fn translate(&self, _program: &str, args: Vec<String>) -> Vec<String> {
        args
    }
}

/// How a command line is wrapped in a shell invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellStrategy {
    /// `<shell> -c <command>`
    Posix { shell: String },
    /// `<cmd> /d /s /c "<command>"`
    WindowsCmd { shell: String },
    /// `<shell> -c <command>` with Windows quoting
    WindowsOther { shell: String },
}

const POSIX_DEFAULT_SHELL: &str = "/bin/sh";
const WINDOWS_DEFAULT_SHELL: &str = "cmd.exe";

impl ShellStrategy {
    /// Pick the strategy for `request`, or `None` when no shell is wanted
    ///
    /// On Windows the default shell is `%COMSPEC%` from `env`, falling back
    /// to `cmd.exe`.
    pub fn select(
        request: &ShellRequest,
        platform: Platform,
        env: &HashMap<String, String>,
    ) -> Option<Self> {
        if !request.is_enabled() {
            return None;
        }

        let explicit = match request {
            ShellRequest::Program(program) => Some(program.clone()),
            ShellRequest::Enabled(_) => None,
        };

        Some(match platform {
            Platform::Posix => ShellStrategy::Posix {
                shell: explicit.unwrap_or_else(|| POSIX_DEFAULT_SHELL.to_string()),
            },
            Platform::Windows => {
                let shell = explicit.unwrap_or_else(|| {
                    env.iter()
                        .find(|(key, _)| key.eq_ignore_ascii_case("COMSPEC"))
                        .map(|(_, value)| value.clone())
                        .unwrap_or_else(|| WINDOWS_DEFAULT_SHELL.to_string())
                });
                if is_cmd_family(&shell) {
                    ShellStrategy::WindowsCmd { shell }
                } else {
                    ShellStrategy::WindowsOther { shell }
                }
            }
        })
    }

    pub fn shell(&self) -> &str {
        match self {
            ShellStrategy::Posix { shell }
            | ShellStrategy::WindowsCmd { shell }
            | ShellStrategy::WindowsOther { shell } => shell,
        }
    }

    /// Whether the wrapped arguments bypass the runtime's own quoting
    pub fn verbatim_args(&self) -> bool {
        matches!(self, ShellStrategy::WindowsCmd { .. })
    }

    /// Escape one argument for this shell
    pub fn escape(&self, arg: &str) -> String {
        match self {
            ShellStrategy::Posix { .. } => escape_posix(arg),
            ShellStrategy::WindowsCmd { .. } | ShellStrategy::WindowsOther { .. } => {
                escape_windows(arg)
            }
        }
    }

    /// Join the program and escaped arguments into one command line
    ///
    /// The program is kept verbatim since callers routinely pass a whole
    /// command line as the program in shell mode.
    pub fn command_line(&self, program: &str, args: &[String]) -> String {
        let mut line = program.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(&self.escape(arg));
        }
        line
    }

    /// Wrap `command` in the shell invocation
    pub fn wrap(&self, command: String) -> (String, Vec<String>) {
        match self {
            ShellStrategy::WindowsCmd { shell } => (
                shell.clone(),
                vec![
                    "/d".to_string(),
                    "/s".to_string(),
                    "/c".to_string(),
                    format!("\"{}\"", command),
                ],
            ),
            ShellStrategy::Posix { shell } | ShellStrategy::WindowsOther { shell } => {
                (shell.clone(), vec!["-c".to_string(), command])
            }
        }
    }
}

fn is_cmd_family(shell: &str) -> bool {
    let name = shell
        .rsplit(|c| c == '\\' || c == '/')
        .next()
        .unwrap_or(shell)
        .to_ascii_lowercase();
    name == "cmd" || name == "cmd.exe"
}

/// Quote `arg` for a POSIX shell
///
/// Arguments made only of `[A-Za-z0-9_./-]` pass through unchanged.
pub fn escape_posix(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let plain = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-'));
    if plain {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Quote `arg` following the MSVCRT command-line parsing rules
///
/// Backslashes are only special before a quote: a run of them followed by a
/// quote (or by the closing quote) is doubled.
pub fn escape_windows(arg: &str) -> String {
    if arg.is_empty() {
        return "\"\"".to_string();
    }
    if !arg
        .chars()
        .any(|c| c.is_whitespace() || c == '"' || c == '\\')
    {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                push_backslashes(&mut quoted, backslashes * 2 + 1);
                quoted.push('"');
                backslashes = 0;
            }
            _ => {
                push_backslashes(&mut quoted, backslashes);
                quoted.push(c);
                backslashes = 0;
            }
        }
    }
    push_backslashes(&mut quoted, backslashes * 2);
    quoted.push('"');
    quoted
}

fn push_backslashes(out: &mut String, count: usize) {
    out.extend(std::iter::repeat('\\').take(count));
}

/// Program and arguments ready for the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Arguments are already quoted for the command line and must not be
    /// quoted again (`cmd.exe /d /s /c "..."`)
    pub verbatim: bool,
}

/// Produce the program and arguments to hand to the OS
pub fn build(
    program: &str,
    args: &[String],
    shell: &ShellRequest,
    platform: Platform,
    env: &HashMap<String, String>,
) -> BuiltCommand {
    match ShellStrategy::select(shell, platform, env) {
        None => BuiltCommand {
            program: program.to_string(),
            args: args.to_vec(),
            verbatim: false,
        },
        Some(strategy) => {
            let command = strategy.command_line(program, args);
            debug!(shell = %strategy.shell(), command = %command, "Running through shell");
            let verbatim = strategy.verbatim_args();
            let (program, args) = strategy.wrap(command);
            BuiltCommand {
                program,
                args,
                verbatim,
            }
        }
    }
}
