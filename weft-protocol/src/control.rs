//! Control channel messages
//!
//! Chunks on stream 31 carry a type-tagged message: the first payload byte
//! selects the message type and the rest is the message body.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Control message type tag (first payload byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlType {
    /// Padding, dropped by the receiver
    Discard = 0,
    /// UTF-8 JSON interpreted against [`ServerMessage`]
    JsonObject = 1,
    /// Application JSON, passed through verbatim
    UserJsonObject = 2,
    /// Application binary payload
    UserBinaryData = 3,
    /// Application UTF-8 string
    UserString = 4,
}

impl ControlType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ControlType::Discard),
            1 => Some(ControlType::JsonObject),
            2 => Some(ControlType::UserJsonObject),
            3 => Some(ControlType::UserBinaryData),
            4 => Some(ControlType::UserString),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Typed messages the server sends on the control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Ask the client to interject application content into playback
    Interject {
        #[serde(default)]
        data: serde_json::Value,
    },
}

/// A fully received control message
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Filler bytes (length of the padding body, tag excluded)
    Discard(usize),
    Server(ServerMessage),
    UserJson(serde_json::Value),
    UserBinary(Bytes),
    UserString(String),
}

impl ControlMessage {
    pub fn control_type(&self) -> ControlType {
        match self {
            ControlMessage::Discard(_) => ControlType::Discard,
            ControlMessage::Server(_) => ControlType::JsonObject,
            ControlMessage::UserJson(_) => ControlType::UserJsonObject,
            ControlMessage::UserBinary(_) => ControlType::UserBinaryData,
            ControlMessage::UserString(_) => ControlType::UserString,
        }
    }

    /// Serialize to a control chunk payload (tag byte + body)
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.control_type().as_u8());

        match self {
            ControlMessage::Discard(len) => buf.put_bytes(0, *len),
            ControlMessage::Server(msg) => {
                // Serializing a plain enum of JSON values cannot fail
                let json = serde_json::to_vec(msg).unwrap_or_default();
                buf.put_slice(&json);
            }
            ControlMessage::UserJson(value) => buf.put_slice(value.to_string().as_bytes()),
            ControlMessage::UserBinary(data) => buf.put_slice(data),
            ControlMessage::UserString(s) => buf.put_slice(s.as_bytes()),
        }

        buf.freeze()
    }

    /// Parse a complete control chunk payload
    ///
    /// Unknown tags and malformed JSON are logged and yield `None`.
    pub fn from_bytes(payload: &[u8]) -> Option<Self> {
        let (&tag, body) = payload.split_first()?;

        let Some(control_type) = ControlType::from_u8(tag) else {
            tracing::warn!("Dropping control message with unknown type {}", tag);
            return None;
        };

        match control_type {
            ControlType::Discard => Some(ControlMessage::Discard(body.len())),
            ControlType::JsonObject => match serde_json::from_slice(body) {
                Ok(msg) => Some(ControlMessage::Server(msg)),
                Err(e) => {
                    tracing::warn!("Dropping malformed server message: {}", e);
                    None
                }
            },
            ControlType::UserJsonObject => match serde_json::from_slice(body) {
                Ok(value) => Some(ControlMessage::UserJson(value)),
                Err(e) => {
                    tracing::warn!("Dropping malformed user JSON message: {}", e);
                    None
                }
            },
            ControlType::UserBinaryData => {
                Some(ControlMessage::UserBinary(Bytes::copy_from_slice(body)))
            }
            ControlType::UserString => Some(ControlMessage::UserString(
                String::from_utf8_lossy(body).into_owned(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_type_tags() {
        for tag in 0..=4u8 {
            assert_eq!(ControlType::from_u8(tag).unwrap().as_u8(), tag);
        }
        assert!(ControlType::from_u8(5).is_none());
    }

    #[test]
    fn test_interject_message() {
        let msg = ControlMessage::Server(ServerMessage::Interject {
            data: json!({"clip": "intro"}),
        });
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 1);
        assert!(std::str::from_utf8(&bytes[1..]).unwrap().contains("\"interject\""));

        assert_eq!(ControlMessage::from_bytes(&bytes), Some(msg));
    }

    #[test]
    fn test_user_payloads() {
        let string = ControlMessage::UserString("hello".to_string());
        assert_eq!(ControlMessage::from_bytes(&string.to_bytes()), Some(string));

        let binary = ControlMessage::UserBinary(Bytes::from_static(&[9, 8, 7]));
        assert_eq!(ControlMessage::from_bytes(&binary.to_bytes()), Some(binary));

        let user_json = ControlMessage::UserJson(json!([1, 2, 3]));
        assert_eq!(
            ControlMessage::from_bytes(&user_json.to_bytes()),
            Some(user_json)
        );
    }

    #[test]
    fn test_discard_length() {
        let bytes = ControlMessage::Discard(10).to_bytes();
        assert_eq!(bytes.len(), 11);
        assert_eq!(
            ControlMessage::from_bytes(&bytes),
            Some(ControlMessage::Discard(10))
        );
    }

    #[test]
    fn test_malformed_messages_dropped() {
        assert!(ControlMessage::from_bytes(&[]).is_none());
        assert!(ControlMessage::from_bytes(&[200, 1, 2]).is_none());
        assert!(ControlMessage::from_bytes(b"\x01{not json").is_none());
        assert!(ControlMessage::from_bytes(b"\x01{\"type\":\"unknown\"}").is_none());
    }
}
