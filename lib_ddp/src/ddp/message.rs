//! # DDP Messages
//!
//! Serde model of the subset of the Distributed Data Protocol that a
//! subscribing client speaks. Every frame is a JSON object tagged by its
//! `msg` field. Frames without a `msg` field (the legacy `server_id` greeting)
//! decode to `None`; frames with an unknown `msg` decode to
//! [`ServerMessage::Other`] and are ignored by the core.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The fields of a single document, as carried by `added` / `changed`.
pub type Document = Map<String, Value>;

/// Protocol version proposed in the `connect` handshake.
pub const DDP_VERSION: &str = "1";

/// Versions the client is willing to fall back to, most preferred first.
pub const DDP_SUPPORTED_VERSIONS: [&str; 3] = ["1", "pre2", "pre1"];

/// Messages sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Opens a DDP session over an already established socket.
    Connect {
        /// Proposed protocol version.
        version: String,
        /// All versions the client supports.
        support: Vec<String>,
        /// Previous session id (reconnect hint, servers may ignore it).
        #[serde(skip_serializing_if = "Option::is_none", default)]
        session: Option<String>,
    },
    /// Heartbeat request.
    Ping {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        id: Option<String>,
    },
    /// Heartbeat reply to a server `ping`.
    Pong {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        id: Option<String>,
    },
    /// Starts a publication on the server.
    Sub {
        /// Client chosen subscription id, echoed back in `ready` / `nosub`.
        id: String,
        /// Name of the server-side publication.
        name: String,
        /// Publication arguments.
        #[serde(default)]
        params: Vec<Value>,
    },
    /// Stops a publication.
    Unsub {
        id: String,
    },
}

impl ClientMessage {
    /// The handshake frame sent right after the socket opens.
    pub fn connect() -> Self {
        ClientMessage::Connect {
            version: DDP_VERSION.to_string(),
            support: DDP_SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            session: None,
        }
    }

    /// Serializes the frame to its JSON text form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg")]
pub enum ServerMessage {
    /// Handshake accepted.
    #[serde(rename = "connected")]
    Connected { session: String },
    /// Handshake rejected; `version` is the one the server would accept.
    #[serde(rename = "failed")]
    Failed { version: String },
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        id: Option<String>,
    },
    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        id: Option<String>,
    },
    /// One or more subscriptions have sent their initial data set.
    #[serde(rename = "ready")]
    Ready { subs: Vec<String> },
    /// A subscription was refused or stopped by the server.
    #[serde(rename = "nosub")]
    NoSub {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<Value>,
    },
    #[serde(rename = "added")]
    Added {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Document,
    },
    #[serde(rename = "changed")]
    Changed {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Document,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        cleared: Vec<String>,
    },
    #[serde(rename = "removed")]
    Removed { collection: String, id: String },
    /// Ordered-collection insert; the position hint is not tracked.
    #[serde(rename = "addedBefore")]
    AddedBefore {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Document,
        #[serde(default)]
        before: Option<String>,
    },
    /// Ordered-collection move; carries no field data.
    #[serde(rename = "movedBefore")]
    MovedBefore {
        collection: String,
        id: String,
        #[serde(default)]
        before: Option<String>,
    },
    /// Server-side protocol error about a message we sent.
    #[serde(rename = "error")]
    Error {
        reason: String,
        #[serde(rename = "offendingMessage", skip_serializing_if = "Option::is_none", default)]
        offending_message: Option<Value>,
    },
    /// Anything this client does not act on (`result`, `updated`, ...).
    #[serde(other)]
    Other,
}

impl ServerMessage {
    /// Decodes one text frame.
    ///
    /// Returns `Ok(None)` for frames that are valid JSON objects without a
    /// `msg` field, such as the `{"server_id": "0"}` greeting.
    pub fn decode(text: &str) -> Result<Option<Self>, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("msg").is_none() {
            return Ok(None);
        }
        serde_json::from_value(value).map(Some)
    }

    /// The collection a data message refers to, if it is one.
    pub fn collection(&self) -> Option<&str> {
        match self {
            ServerMessage::Added { collection, .. }
            | ServerMessage::Changed { collection, .. }
            | ServerMessage::Removed { collection, .. }
            | ServerMessage::AddedBefore { collection, .. }
            | ServerMessage::MovedBefore { collection, .. } => Some(collection),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connect_frame_shape() {
        let text = ClientMessage::connect().encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"msg": "connect", "version": "1", "support": ["1", "pre2", "pre1"]}));
    }

    #[test]
    fn sub_frame_shape() {
        let msg = ClientMessage::Sub { id: "1-0".into(), name: "users".into(), params: vec![json!(5)] };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"msg": "sub", "id": "1-0", "name": "users", "params": [5]}));
    }

    #[test]
    fn decodes_changed_with_cleared() {
        let text = r#"{"msg":"changed","collection":"users","id":"u1","fields":{"name":"b"},"cleared":["age"]}"#;
        let msg = ServerMessage::decode(text).unwrap().unwrap();
        match msg {
            ServerMessage::Changed { collection, id, fields, cleared } => {
                assert_eq!(collection, "users");
                assert_eq!(id, "u1");
                assert_eq!(fields.get("name"), Some(&json!("b")));
                assert_eq!(cleared, vec!["age".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn added_without_fields_defaults_to_empty() {
        let msg = ServerMessage::decode(r#"{"msg":"added","collection":"rooms","id":"r1"}"#).unwrap().unwrap();
        assert_eq!(
            msg,
            ServerMessage::Added { collection: "rooms".into(), id: "r1".into(), fields: Document::new() }
        );
    }

    #[test]
    fn server_id_greeting_is_skipped() {
        assert_eq!(ServerMessage::decode(r#"{"server_id":"0"}"#).unwrap(), None);
    }

    #[test]
    fn unknown_messages_decode_as_other() {
        let msg = ServerMessage::decode(r#"{"msg":"updated","methods":["1"]}"#).unwrap().unwrap();
        assert_eq!(msg, ServerMessage::Other);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(ServerMessage::decode("not json").is_err());
    }
}
