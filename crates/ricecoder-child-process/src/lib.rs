//! # ricecoder-child-process
//!
//! **Purpose**: Spawn child processes and follow them from creation to final close
//!
//! ## Features
//!
//! - **Stdio wiring**: one mode for all slots or a per-slot list; pipes,
//!   inheritance, `/dev/null`, pass-through descriptors, extra pipes
//! - **Shell mode**: platform-correct shell invocation and argument quoting
//! - **Ordered lifecycle**: `Spawn`, then `Exit`, then `Close` once every
//!   stream and the control channel finished, no matter how they race
//! - **Signals**: idempotent `kill` by name or number; abort through a
//!   cancellation token
//! - **IPC**: an `ipc` slot opens a [`ricecoder_ipc::ControlChannel`] to the
//!   child, which finds it again with [`ricecoder_ipc::connect_to_parent`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ricecoder_child_process::{spawn, ChildEvent, SpawnOptions, StdioSpec};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = SpawnOptions::new("worker")
//!     .stdio(StdioSpec::from_keywords(&["pipe", "inherit", "inherit", "ipc"])?);
//! let child = spawn(options)?;
//! let mut events = child.take_events().unwrap();
//!
//! child.send(json!({"hello": "world"}));
//! let mut messages = child.messages().unwrap();
//! if let Some(reply) = messages.recv().await {
//!     println!("child said {:?}", reply);
//! }
//!
//! while let Some(event) = events.recv().await {
//!     if let ChildEvent::Close { code, signal } = event {
//!         println!("closed: {:?} {:?}", code, signal);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod child;
pub mod command;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod signal;
pub mod spawner;
pub mod stdio;
pub mod streams;

pub use child::{ChildProcess, SendCallback};
pub use command::{
    ArgTranslator, BuiltCommand, NoTranslation, Platform, ShellRequest, ShellStrategy,
};
pub use config::SpawnOptions;
pub use error::{ProcessError, Result};
pub use lifecycle::{ChildEvent, ChildEvents, LifecycleState};
pub use signal::KillSignal;
pub use spawner::{spawn, Spawner};
pub use stdio::{ParentStream, StdioDescriptor, StdioEntry, StdioKeyword, StdioSpec};
#[cfg(unix)]
pub use streams::ChildPipe;
pub use streams::{ChildReadable, ChildWritable, StdioStream};

pub use ricecoder_ipc::{Message, SerializationMode};
