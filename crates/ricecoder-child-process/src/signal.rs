//! Signal names and numbers accepted by `kill`

use std::fmt;

use crate::error::{ProcessError, Result};

/// A signal that can be delivered to a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KillSignal {
    name: &'static str,
    number: i32,
}

impl KillSignal {
    pub const SIGTERM: KillSignal = KillSignal {
        name: "SIGTERM",
        number: 15,
    };
    pub const SIGKILL: KillSignal = KillSignal {
        name: "SIGKILL",
        number: 9,
    };
    pub const SIGINT: KillSignal = KillSignal {
        name: "SIGINT",
        number: 2,
    };

    /// Canonical name, e.g. `SIGTERM`
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn number(&self) -> i32 {
        self.number
    }

    /// Parse a signal name (`SIGTERM` or `TERM`) or a decimal number
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if let Ok(number) = value.parse::<i32>() {
            return Self::from_number(number);
        }
        let upper = value.to_ascii_uppercase();
        let name = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{}", upper)
        };
        Self::from_name(&name).ok_or_else(|| ProcessError::UnknownSignal(value.to_string()))
    }

    /// Look up a signal by number
    pub fn from_number(number: i32) -> Result<Self> {
        lookup_number(number).ok_or_else(|| ProcessError::UnknownSignal(number.to_string()))
    }

    #[cfg(unix)]
    fn from_name(name: &str) -> Option<Self> {
        use std::str::FromStr;

        nix::sys::signal::Signal::from_str(name)
            .ok()
            .map(Self::from)
    }

    #[cfg(unix)]
    pub(crate) fn as_nix(&self) -> nix::sys::signal::Signal {
        // Only constructed from valid nix signals or the constants above
        nix::sys::signal::Signal::try_from(self.number).unwrap_or(nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(not(unix))]
    fn from_name(name: &str) -> Option<Self> {
        WINDOWS_SIGNALS.iter().copied().find(|s| s.name == name)
    }
}

#[cfg(unix)]
fn lookup_number(number: i32) -> Option<KillSignal> {
    nix::sys::signal::Signal::try_from(number)
        .ok()
        .map(KillSignal::from)
}

#[cfg(not(unix))]
fn lookup_number(number: i32) -> Option<KillSignal> {
    WINDOWS_SIGNALS.iter().copied().find(|s| s.number == number)
}

/// Signals a Windows child can be sent; all of them terminate it
#[cfg(not(unix))]
const WINDOWS_SIGNALS: &[KillSignal] = &[
    KillSignal::SIGINT,
    KillSignal {
        name: "SIGBREAK",
        number: 21,
    },
    KillSignal::SIGKILL,
    KillSignal::SIGTERM,
];

#[cfg(unix)]
impl From<nix::sys::signal::Signal> for KillSignal {
    fn from(signal: nix::sys::signal::Signal) -> Self {
        KillSignal {
            name: signal.as_str(),
            number: signal as i32,
        }
    }
}

impl Default for KillSignal {
    fn default() -> Self {
        KillSignal::SIGTERM
    }
}

impl fmt::Display for KillSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl TryFrom<&str> for KillSignal {
    type Error = ProcessError;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl TryFrom<i32> for KillSignal {
    type Error = ProcessError;

    fn try_from(number: i32) -> Result<Self> {
        Self::from_number(number)
    }
}

/// Name of the signal with `number`, for reporting how a process died
#[cfg(unix)]
pub(crate) fn signal_name(number: i32) -> String {
    lookup_number(number)
        .map(|s| s.name.to_string())
        .unwrap_or_else(|| format!("SIG{}", number))
}
