//! Frame codecs for the two serialization modes
//!
//! - `json`: one UTF-8 JSON document per line (`\n` terminated)
//! - `advanced`: 4-byte big-endian length prefix followed by a MessagePack body
//!
//! The mode is chosen once when a channel is opened and never changes.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LinesCodec, LinesCodecError};

use crate::error::{IpcError, Result};
use crate::message::Message;

/// Default cap on a single incoming frame (8 MiB)
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Wire encoding negotiated at channel-open time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationMode {
    /// Newline-delimited JSON
    #[default]
    Json,
    /// Length-prefixed MessagePack, able to carry binary buffers
    Advanced,
}

impl SerializationMode {
    /// Name used on the wire and in the environment
    pub fn as_str(&self) -> &'static str {
        match self {
            SerializationMode::Json => "json",
            SerializationMode::Advanced => "advanced",
        }
    }
}

impl fmt::Display for SerializationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SerializationMode {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(SerializationMode::Json),
            "advanced" => Ok(SerializationMode::Advanced),
            other => Err(IpcError::InvalidSerializationMode(other.to_string())),
        }
    }
}

/// Encoder/decoder for control channel frames
#[derive(Debug)]
pub struct MessageCodec {
    mode: SerializationMode,
    max_frame_length: usize,
    lines: LinesCodec,
    frames: LengthDelimitedCodec,
}

impl MessageCodec {
    /// Create a codec with the default frame limit
    pub fn new(mode: SerializationMode) -> Self {
        Self::with_max_frame_length(mode, DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Create a codec that rejects frames longer than `max_frame_length`
    pub fn with_max_frame_length(mode: SerializationMode, max_frame_length: usize) -> Self {
        Self {
            mode,
            max_frame_length,
            lines: LinesCodec::new_with_max_length(max_frame_length),
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }

    pub fn mode(&self) -> SerializationMode {
        self.mode
    }

    /// Encode a single message into a standalone frame
    pub fn encode_frame(&mut self, message: &Message) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(message, &mut buf)?;
        Ok(buf.freeze())
    }

    fn frame_error(&self, err: io::Error) -> IpcError {
        if err.kind() == io::ErrorKind::InvalidData || err.kind() == io::ErrorKind::InvalidInput {
            IpcError::FrameTooLarge {
                max: self.max_frame_length,
            }
        } else {
            IpcError::Io(err)
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match self.mode {
            SerializationMode::Json => loop {
                let line = match self.lines.decode(src) {
                    Ok(Some(line)) => line,
                    Ok(None) => return Ok(None),
                    Err(LinesCodecError::MaxLineLengthExceeded) => {
                        return Err(IpcError::FrameTooLarge {
                            max: self.max_frame_length,
                        })
                    }
                    Err(LinesCodecError::Io(e)) => return Err(IpcError::Io(e)),
                };
                // Blank lines carry nothing
                if line.trim().is_empty() {
                    continue;
                }
                let value: serde_json::Value = serde_json::from_str(&line)?;
                return Ok(Some(Message::from(value)));
            },
            SerializationMode::Advanced => {
                let frame = match self.frames.decode(src) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return Ok(None),
                    Err(e) => return Err(self.frame_error(e)),
                };
                Ok(Some(rmp_serde::from_slice(&frame)?))
            }
        }
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = IpcError;

    fn encode(&mut self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        match self.mode {
            SerializationMode::Json => {
                let value = message.to_json()?;
                serde_json::to_writer((&mut *dst).writer(), &value)?;
                dst.put_u8(b'\n');
                Ok(())
            }
            SerializationMode::Advanced => {
                let body = rmp_serde::to_vec_named(message)?;
                self.frames
                    .encode(Bytes::from(body), dst)
                    .map_err(|e| self.frame_error(e))
            }
        }
    }
}
