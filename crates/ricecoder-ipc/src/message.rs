//! Structured values carried over the control channel
//!
//! [`Message`] is a superset of JSON: in addition to the usual scalars,
//! arrays and objects it carries raw byte buffers, which only the
//! `advanced` serialization mode can transmit.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{IpcError, Result};

/// Reserved prefix of internal control commands (`{"cmd": "RICECODER_..."}`)
pub const INTERNAL_PREFIX: &str = "RICECODER_";

/// Control command announcing that the peer closed its end of the channel
pub const CLOSE_COMMAND: &str = "RICECODER_CLOSE";

/// A value sent or received over the control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Binary buffer, `advanced` mode only
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    Array(Vec<Message>),
    Map(BTreeMap<String, Message>),
}

impl Message {
    /// Build an internal control frame for `command`
    pub fn control(command: &str) -> Self {
        let mut map = BTreeMap::new();
        map.insert("cmd".to_string(), Message::String(command.to_string()));
        Message::Map(map)
    }

    /// The internal command name, if this is a control frame
    pub fn internal_command(&self) -> Option<&str> {
        match self {
            Message::Map(map) => match map.get("cmd") {
                Some(Message::String(cmd)) if cmd.starts_with(INTERNAL_PREFIX) => Some(cmd),
                _ => None,
            },
            _ => None,
        }
    }

    /// Look up a key when this value is a map
    pub fn get(&self, key: &str) -> Option<&Message> {
        match self {
            Message::Map(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Message::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Message::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Convert into a JSON value
    ///
    /// Fails with [`IpcError::UnsupportedValue`] for byte buffers and
    /// non-finite floats, which JSON cannot represent.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        use serde_json::Value;

        Ok(match self {
            Message::Null => Value::Null,
            Message::Bool(b) => Value::Bool(*b),
            Message::Int(i) => Value::from(*i),
            Message::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .ok_or_else(|| IpcError::UnsupportedValue {
                    mode: "json",
                    reason: format!("non-finite number {}", f),
                })?,
            Message::String(s) => Value::String(s.clone()),
            Message::Bytes(_) => {
                return Err(IpcError::UnsupportedValue {
                    mode: "json",
                    reason: "binary buffers require advanced serialization".to_string(),
                })
            }
            Message::Array(items) => Value::Array(
                items
                    .iter()
                    .map(Message::to_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Message::Map(map) => {
                let mut object = serde_json::Map::new();
                for (key, value) in map {
                    object.insert(key.clone(), value.to_json()?);
                }
                Value::Object(object)
            }
        })
    }
}

impl From<serde_json::Value> for Message {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Message::Null,
            Value::Bool(b) => Message::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Message::Int(i),
                None => Message::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Message::String(s),
            Value::Array(items) => Message::Array(items.into_iter().map(Message::from).collect()),
            Value::Object(object) => Message::Map(
                object
                    .into_iter()
                    .map(|(k, v)| (k, Message::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::String(s.to_string())
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::String(s)
    }
}

impl From<bool> for Message {
    fn from(b: bool) -> Self {
        Message::Bool(b)
    }
}

impl From<i64> for Message {
    fn from(i: i64) -> Self {
        Message::Int(i)
    }
}

impl From<f64> for Message {
    fn from(f: f64) -> Self {
        Message::Float(f)
    }
}

impl TryFrom<Message> for serde_json::Value {
    type Error = IpcError;

    fn try_from(message: Message) -> Result<Self> {
        message.to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_internal_command_detection() {
        let close = Message::control(CLOSE_COMMAND);
        assert_eq!(close.internal_command(), Some(CLOSE_COMMAND));

        let user = Message::from(json!({"cmd": "build"}));
        assert_eq!(user.internal_command(), None);

        let unknown = Message::from(json!({"cmd": "RICECODER_PING"}));
        assert_eq!(unknown.internal_command(), Some("RICECODER_PING"));

        assert_eq!(Message::from("RICECODER_CLOSE").internal_command(), None);
    }

    #[test]
    fn test_json_conversion_preserves_structure() {
        let value = json!({"hello": "world", "n": 3, "f": 1.5, "list": [true, null]});
        let message = Message::from(value.clone());
        assert_eq!(message.get("hello").and_then(Message::as_str), Some("world"));
        assert_eq!(message.get("n"), Some(&Message::Int(3)));
        assert_eq!(message.to_json().unwrap(), value);
    }

    #[test]
    fn test_bytes_rejected_in_json() {
        let message = Message::Bytes(vec![1, 2, 3]);
        assert!(matches!(
            message.to_json(),
            Err(IpcError::UnsupportedValue { mode: "json", .. })
        ));
    }

    #[test]
    fn test_non_finite_float_rejected_in_json() {
        assert!(Message::Float(f64::INFINITY).to_json().is_err());
        assert!(Message::Float(2.5).to_json().is_ok());
    }
}
