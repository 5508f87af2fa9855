//! Error types for child process management

use ricecoder_ipc::IpcError;
use std::convert::Infallible;
use std::io;
use thiserror::Error;

/// Child process errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Malformed stdio configuration
    #[error("Invalid stdio configuration: {0}")]
    InvalidStdioSpec(String),

    /// Signal name or number not known on this platform
    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    /// The OS refused to create the process
    #[error("{syscall} {code}: {source}")]
    Spawn {
        /// Errno-style code, e.g. `ENOENT`
        code: String,
        /// Always `spawn <program>`
        syscall: String,
        /// Program that failed to start
        path: String,
        #[source]
        source: io::Error,
    },

    /// The abort token fired while the process was still running
    #[error("The operation was aborted")]
    Aborted,

    /// Signal delivery failed for a reason other than the process being gone
    #[error("Failed to kill process: {0}")]
    KillFailed(String),

    /// Waiting for the process to exit failed
    #[error("Failed to wait for process: {0}")]
    Wait(#[source] io::Error),

    /// Requested stdio wiring not available on this platform
    #[error("Not supported on this platform: {0}")]
    Unsupported(String),

    /// Control channel failure
    #[error(transparent)]
    Ipc(#[from] IpcError),
}

impl ProcessError {
    /// Build a spawn error for `program` from the OS error
    pub fn spawn(program: &str, source: io::Error) -> Self {
        ProcessError::Spawn {
            code: errno_name(&source),
            syscall: format!("spawn {}", program),
            path: program.to_string(),
            source,
        }
    }

    /// Errno-style code of a spawn failure
    pub fn code(&self) -> Option<&str> {
        match self {
            ProcessError::Spawn { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<Infallible> for ProcessError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

#[cfg(unix)]
fn errno_name(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(raw) => format!("{:?}", nix::errno::Errno::from_raw(raw)),
        None => fallback_errno_name(err.kind()).to_string(),
    }
}

#[cfg(not(unix))]
fn errno_name(err: &io::Error) -> String {
    fallback_errno_name(err.kind()).to_string()
}

fn fallback_errno_name(kind: io::ErrorKind) -> &'static str {
    match kind {
        io::ErrorKind::NotFound => "ENOENT",
        io::ErrorKind::PermissionDenied => "EACCES",
        io::ErrorKind::InvalidInput => "EINVAL",
        _ => "UNKNOWN",
    }
}

/// Result type for child process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
