//! Rendezvous wire messages.
//!
//! One JSON object per WebSocket text frame. Every client frame carries a
//! `type` and (for acking) an `id`; parsing happens in two steps so the `id`
//! can be acked even when the payload is later rejected by a handler: first
//! the `type`/`id` envelope, then the per-type payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::welcome::WelcomeInfo;

/// A parsed inbound frame: the envelope `id` plus the typed command.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    pub id: Option<String>,
    pub command: ClientCommand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Ping(Ping),
    Bind(Bind),
    List,
    Allocate,
    Claim(Claim),
    Release(Release),
    Open(Open),
    Add(Add),
    Close(Close),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Ping {
    #[serde(default)]
    pub ping: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Bind {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub side: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Claim {
    #[serde(default)]
    pub nameplate: String,
}

/// `nameplate` is optional; when supplied it must match the session's.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Release {
    #[serde(default)]
    pub nameplate: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Open {
    #[serde(default)]
    pub mailbox: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Add {
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub body: String,
}

/// `mailbox` is optional; when supplied it must match the opened one.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Close {
    #[serde(default)]
    pub mailbox: String,
    #[serde(default)]
    pub mood: String,
}

/// Why an inbound frame could not be turned into a [`ClientFrame`].
#[derive(Debug)]
pub enum ParseError {
    /// Not a JSON object, or a payload field of the wrong shape.
    Malformed(serde_json::Error),
    /// Valid JSON but a `type` this server does not speak.
    UnknownType(String),
    /// Valid JSON without a string `type` field.
    MissingType,
}

impl ClientFrame {
    /// Parse one raw text frame.
    pub fn parse(raw: &[u8]) -> Result<ClientFrame, ParseError> {
        let value: Value = serde_json::from_slice(raw).map_err(ParseError::Malformed)?;

        let kind = match value.get("type").and_then(Value::as_str) {
            Some(k) => k.to_owned(),
            None => return Err(ParseError::MissingType),
        };
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let command = match kind.as_str() {
            "ping" => ClientCommand::Ping(payload(value)?),
            "bind" => ClientCommand::Bind(payload(value)?),
            "list" => ClientCommand::List,
            "allocate" => ClientCommand::Allocate,
            "claim" => ClientCommand::Claim(payload(value)?),
            "release" => ClientCommand::Release(payload(value)?),
            "open" => ClientCommand::Open(payload(value)?),
            "add" => ClientCommand::Add(payload(value)?),
            "close" => ClientCommand::Close(payload(value)?),
            _ => return Err(ParseError::UnknownType(kind)),
        };

        Ok(ClientFrame { id, command })
    }
}

fn payload<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ParseError> {
    serde_json::from_value(value).map_err(ParseError::Malformed)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameplateEntry {
    pub id: String,
}

/// Server-originated frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Welcome {
        welcome: WelcomeInfo,
    },
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        pong: i64,
    },
    Nameplates {
        nameplates: Vec<NameplateEntry>,
    },
    Allocated {
        nameplate: String,
    },
    Claimed {
        mailbox: String,
    },
    Released {},
    Message {
        side: String,
        phase: String,
        body: String,
        id: String,
        server_rx: i64,
    },
    Closed {},
    Error {
        error: String,
        /// The raw client frame that provoked the error.
        orig: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_envelope_and_payload() {
        let frame = ClientFrame::parse(br#"{"type":"claim","id":"m1","nameplate":"4"}"#).unwrap();
        assert_eq!(frame.id.as_deref(), Some("m1"));
        assert_eq!(
            frame.command,
            ClientCommand::Claim(Claim {
                nameplate: "4".into()
            })
        );
    }

    #[test]
    fn missing_payload_fields_default() {
        let frame = ClientFrame::parse(br#"{"type":"ping","id":"p"}"#).unwrap();
        assert_eq!(frame.command, ClientCommand::Ping(Ping { ping: 0 }));
    }

    #[test]
    fn add_body_rides_the_envelope_id() {
        let frame =
            ClientFrame::parse(br#"{"type":"add","id":"m3","phase":"pake","body":"deadbeef"}"#)
                .unwrap();
        assert_eq!(frame.id.as_deref(), Some("m3"));
        let ClientCommand::Add(add) = frame.command else {
            panic!("expected add");
        };
        assert_eq!(add.phase, "pake");
        assert_eq!(add.body, "deadbeef");
    }

    #[test]
    fn unknown_type_is_its_own_error() {
        match ClientFrame::parse(br#"{"type":"teleport","id":"x"}"#) {
            Err(ParseError::UnknownType(kind)) => assert_eq!(kind, "teleport"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            ClientFrame::parse(b"not json"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            ClientFrame::parse(br#"{"id":"x"}"#),
            Err(ParseError::MissingType)
        ));
    }

    #[test]
    fn server_frames_carry_their_type_tag() {
        let released = serde_json::to_value(&ServerMessage::Released {}).unwrap();
        assert_eq!(released, serde_json::json!({"type": "released"}));

        let ack = serde_json::to_value(&ServerMessage::Ack {
            id: Some("m1".into()),
        })
        .unwrap();
        assert_eq!(ack, serde_json::json!({"type": "ack", "id": "m1"}));

        let msg = serde_json::to_value(&ServerMessage::Message {
            side: "L".into(),
            phase: "pake".into(),
            body: "deadbeef".into(),
            id: "m1".into(),
            server_rx: 7,
        })
        .unwrap();
        assert_eq!(msg["type"], "message");
        assert_eq!(msg["server_rx"], 7);
    }
}
