//! Transport wire protocol
//!
//! JSON text frames tagged by `type`. Field names follow the camelCase
//! convention of the wire (`messageId`, `messageHash`); the envelope keeps
//! its own snake_case fields.

use crate::crypto::SignedEnvelope;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Server-authoritative delivery status. Ordered: `Pending < Delivered < Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Read => "READ",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(MessageStatus::Pending),
            "DELIVERED" => Ok(MessageStatus::Delivered),
            "READ" => Ok(MessageStatus::Read),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Unknown message status: {0}")]
    UnknownStatus(String),
}

/// Frames sent by clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Identify {
        username: String,
    },
    SignedChat {
        message: SignedEnvelope,
    },
    #[serde(rename_all = "camelCase")]
    ReadReceipt {
        message_id: String,
        from: String,
        to: String,
    },
}

/// Frames sent by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    System {
        message: String,
    },
    Error {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    SignedChat {
        from: String,
        message: SignedEnvelope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    /// Forwarded to an online recipient
    #[serde(rename_all = "camelCase")]
    Delivered {
        to: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_hash: Option<String>,
    },
    /// Queued for an offline recipient
    #[serde(rename_all = "camelCase")]
    Pending {
        to: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_hash: Option<String>,
    },
    /// Stored, but the live forward failed
    #[serde(rename_all = "camelCase")]
    Saved {
        to: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_hash: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        message_id: String,
        status: MessageStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Frame type name, for logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Identify { .. } => "identify",
            ClientFrame::SignedChat { .. } => "signed_chat",
            ClientFrame::ReadReceipt { .. } => "read_receipt",
        }
    }
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn system(message: impl Into<String>) -> Self {
        ServerFrame::System { message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_key_pair, sign_envelope_at};
    use serde_json::json;

    fn envelope() -> SignedEnvelope {
        let kp = derive_key_pair("alice", "pw").unwrap();
        sign_envelope_at("alice", "bob", "hi", "2024-01-01T00:00:00.000Z", &kp.private_key).unwrap()
    }

    #[test]
    fn test_status_ordering() {
        assert!(MessageStatus::Pending < MessageStatus::Delivered);
        assert!(MessageStatus::Delivered < MessageStatus::Read);
        assert_eq!("READ".parse::<MessageStatus>().unwrap(), MessageStatus::Read);
        assert!("read".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn test_parse_identify() {
        let frame = ClientFrame::parse(r#"{"type":"identify","username":"bob"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Identify { username: "bob".to_string() });
    }

    #[test]
    fn test_parse_read_receipt_camel_case() {
        let frame =
            ClientFrame::parse(r#"{"type":"read_receipt","messageId":"m1","from":"bob","to":"alice"}"#)
                .unwrap();
        assert_eq!(
            frame,
            ClientFrame::ReadReceipt {
                message_id: "m1".to_string(),
                from: "bob".to_string(),
                to: "alice".to_string(),
            }
        );
    }

    #[test]
    fn test_signed_chat_keeps_envelope_field_names() {
        let frame = ClientFrame::SignedChat { message: envelope() };
        let value: serde_json::Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(value["type"], "signed_chat");
        assert_eq!(value["message"]["sender_username"], "alice");
        assert!(value["message"]["signature"]["r"].is_string());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let frame = ServerFrame::Pending {
            to: "bob".to_string(),
            content: "hi".to_string(),
            message_id: None,
            message_hash: None,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "pending", "to": "bob", "content": "hi"})
        );
    }

    #[test]
    fn test_status_update_wire_form() {
        let frame = ServerFrame::StatusUpdate {
            message_id: "m1".to_string(),
            status: MessageStatus::Delivered,
            from: None,
            to: Some("bob".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "status_update", "messageId": "m1", "status": "DELIVERED", "to": "bob"})
        );
    }

    #[test]
    fn test_server_signed_chat_without_message_id() {
        let env = envelope();
        let text = json!({"type": "signed_chat", "from": "alice", "message": env}).to_string();
        match ServerFrame::parse(&text).unwrap() {
            ServerFrame::SignedChat { message_id, from, .. } => {
                assert_eq!(from, "alice");
                assert!(message_id.is_none());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames() {
        assert!(ClientFrame::parse("not json").is_err());
        assert!(ClientFrame::parse(r#"{"type":"chat","to":"bob"}"#).is_err());
        assert!(ClientFrame::parse(r#"{"type":"identify"}"#).is_err());
    }
}
