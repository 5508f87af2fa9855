//! # ricecoder-ipc
//!
//! **Purpose**: Control channel between a parent process and the children it spawns
//!
//! A channel carries opaque application messages plus a small set of internal
//! control frames over one duplex byte-stream handle.
//!
//! ## Features
//!
//! - **Two wire formats**: newline-delimited JSON, or length-prefixed
//!   MessagePack (`advanced`) that also carries binary buffers
//! - **Buffered delivery**: messages that arrive before anyone listens are
//!   queued and flushed, in order, to the first listener
//! - **Backpressure**: every send reports whether the outbox is still under
//!   its high-water mark
//! - **Keep-alive accounting**: the handle stays referenced while writes are
//!   in flight, unless pinned with `ref_handle`/`unref_handle`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ricecoder_ipc::{ChannelConfig, ControlChannel, SerializationMode};
//! use serde_json::json;
//!
//! # async fn example(stream: tokio::net::UnixStream) -> Result<(), ricecoder_ipc::IpcError> {
//! let (channel, _events) =
//!     ControlChannel::open(stream, SerializationMode::Json, ChannelConfig::default());
//!
//! let mut messages = channel.subscribe();
//! let delivery = channel.send(json!({"hello": "world"}))?;
//! if !delivery.within_limits() {
//!     delivery.completed().await?;
//! }
//!
//! while let Some(message) = messages.recv().await {
//!     println!("{:?}", message);
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod codec;
pub mod env;
pub mod error;
pub mod keepalive;
pub mod message;
mod refs;

pub use channel::{
    ChannelConfig, ChannelEvent, ChannelEvents, ControlChannel, Delivery, DisconnectOrigin,
    MessageStream, DEFAULT_HIGH_WATER_MARK,
};
pub use codec::{MessageCodec, SerializationMode};
#[cfg(unix)]
pub use env::connect_to_parent;
pub use env::{channel_env, channel_from_env, CHANNEL_FD_ENV, SERIALIZATION_MODE_ENV};
pub use error::{IpcError, Result};
pub use keepalive::{KeepAlive, KeepAliveHandle};
pub use message::Message;
