//! IPC echo peer
//!
//! Connects to the control channel inherited from the parent, waits a moment
//! so that early messages queue up unheard, then answers each of the first
//! `N` messages (default 1) with `{"echo": <message>}` and disconnects.
//!
//! Logging goes to stderr; set `RICECODER_LOG` to raise the level.

use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error};

const LISTEN_DELAY: Duration = Duration::from_millis(200);

fn init_logging() {
    let level = match std::env::var("RICECODER_LOG")
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(not(unix))]
fn main() -> ExitCode {
    init_logging();
    error!("Inherited control channels are only supported on Unix");
    ExitCode::FAILURE
}

#[cfg(unix)]
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    use ricecoder_ipc::{connect_to_parent, ChannelConfig, Message};
    use std::collections::BTreeMap;

    init_logging();

    let count = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse::<usize>().ok())
        .unwrap_or(1);

    let (channel, _events) = match connect_to_parent(ChannelConfig::default()) {
        Ok(parts) => parts,
        Err(e) => {
            error!(error = %e, "No parent channel");
            return ExitCode::from(2);
        }
    };

    tokio::time::sleep(LISTEN_DELAY).await;
    let mut messages = channel.subscribe();

    for _ in 0..count {
        let Some(message) = messages.recv().await else {
            debug!("Parent disconnected");
            return ExitCode::SUCCESS;
        };
        debug!(?message, "Echoing message");

        let mut reply = BTreeMap::new();
        reply.insert("echo".to_string(), message);
        let sent = match channel.send(Message::Map(reply)) {
            Ok(delivery) => delivery.completed().await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            error!(error = %e, "Failed to echo message");
            return ExitCode::FAILURE;
        }
    }

    let _ = channel.disconnect();
    ExitCode::SUCCESS
}
