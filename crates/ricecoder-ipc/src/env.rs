//! Child-side channel discovery
//!
//! A parent that opens a control channel tells the child where to find it
//! through two environment variables.

#![allow(unsafe_code)]

use crate::channel::{ChannelConfig, ChannelEvents, ControlChannel};
use crate::codec::SerializationMode;
use crate::error::{IpcError, Result};

/// Descriptor number of the inherited channel end
pub const CHANNEL_FD_ENV: &str = "RICECODER_CHANNEL_FD";

/// Serialization mode the parent opened the channel with
pub const SERIALIZATION_MODE_ENV: &str = "RICECODER_CHANNEL_SERIALIZATION_MODE";

/// Environment entries a parent passes to a child whose channel sits at `fd`
pub fn channel_env(fd: i32, mode: SerializationMode) -> [(String, String); 2] {
    [
        (CHANNEL_FD_ENV.to_string(), fd.to_string()),
        (SERIALIZATION_MODE_ENV.to_string(), mode.as_str().to_string()),
    ]
}

/// Read the channel location from the current environment
pub fn channel_from_env() -> Result<(i32, SerializationMode)> {
    let raw =
        std::env::var(CHANNEL_FD_ENV).map_err(|_| IpcError::MissingChannelFd(CHANNEL_FD_ENV))?;
    let fd = parse_fd(&raw)?;
    let mode = match std::env::var(SERIALIZATION_MODE_ENV) {
        Ok(mode) => mode.parse()?,
        Err(_) => SerializationMode::Json,
    };
    Ok((fd, mode))
}

fn parse_fd(raw: &str) -> Result<i32> {
    match raw.trim().parse::<i32>() {
        Ok(fd) if fd >= 0 => Ok(fd),
        _ => Err(IpcError::InvalidChannelFd(raw.to_string())),
    }
}

/// Open the control channel inherited from the parent process
///
/// The descriptor is taken over by the channel and marked close-on-exec so
/// grandchildren do not inherit it.
#[cfg(unix)]
pub fn connect_to_parent(config: ChannelConfig) -> Result<(ControlChannel, ChannelEvents)> {
    use std::os::unix::io::FromRawFd;

    let (fd, mode) = channel_from_env()?;

    // SAFETY: fcntl on an arbitrary integer only inspects/updates descriptor flags
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(IpcError::InvalidChannelFd(format!("{} is not open", fd)));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } == -1 {
        tracing::warn!(
            fd,
            error = %std::io::Error::last_os_error(),
            "Failed to mark channel descriptor close-on-exec"
        );
    }

    // SAFETY: the descriptor was handed to this process for exclusive use by the parent
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;
    let stream = tokio::net::UnixStream::from_std(stream)?;

    tracing::debug!(fd, mode = %mode, "Connected to parent channel");
    Ok(ControlChannel::open(stream, mode, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_env_entries() {
        let env = channel_env(3, SerializationMode::Advanced);
        assert_eq!(env[0], (CHANNEL_FD_ENV.to_string(), "3".to_string()));
        assert_eq!(
            env[1],
            (SERIALIZATION_MODE_ENV.to_string(), "advanced".to_string())
        );
    }

    #[test]
    fn test_parse_fd() {
        assert_eq!(parse_fd("4").unwrap(), 4);
        assert_eq!(parse_fd(" 5\n").unwrap(), 5);
        assert!(matches!(parse_fd("-1"), Err(IpcError::InvalidChannelFd(_))));
        assert!(matches!(parse_fd("three"), Err(IpcError::InvalidChannelFd(_))));
    }
}
