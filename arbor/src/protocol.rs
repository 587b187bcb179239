//! The arbor wire envelope.
//!
//! Each envelope is one JSON object on its own line. The `Type` field selects
//! the kind, and only the fields that belong to that kind are written:
//!
//! ```text
//! WELCOME:     {"Type":0,"Root":..,"Recent":[..],"Major":..,"Minor":..}
//! QUERY:       {"Type":1,"UUID":..}
//! NEW_MESSAGE: {"Type":2,"UUID":..,"Parent":..,"Content":..,"Username":..,"Timestamp":..}
//! META:        {"Type":3,"Meta":{..}}
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{error::ProtocolError, message::ChatMessage};

pub const WELCOME_TYPE: u8 = 0;
pub const QUERY_TYPE: u8 = 1;
pub const NEW_MESSAGE_TYPE: u8 = 2;
pub const META_TYPE: u8 = 3;

pub const PROTOCOL_MAJOR: u8 = 0;
pub const PROTOCOL_MINOR: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Welcome,
    Query,
    NewMessage,
    Meta,
    Unknown(u8),
}

impl Kind {
    pub fn code(self) -> u8 {
        match self {
            Kind::Welcome => WELCOME_TYPE,
            Kind::Query => QUERY_TYPE,
            Kind::NewMessage => NEW_MESSAGE_TYPE,
            Kind::Meta => META_TYPE,
            Kind::Unknown(code) => code,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Kind::Welcome => "WELCOME",
            Kind::Query => "QUERY",
            Kind::NewMessage => "NEW_MESSAGE",
            Kind::Meta => "META",
            Kind::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Unknown(code) => write!(f, "UNKNOWN({code})"),
            known => f.write_str(known.name()),
        }
    }
}

/// A protocol envelope exchanged between peers.
///
/// Unrecognized `Type` codes decode into [`ProtocolMessage::Unknown`] so the
/// code is preserved, but such envelopes are never valid and cannot be
/// encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub enum ProtocolMessage {
    Welcome {
        root: String,
        recent: Vec<String>,
        major: u8,
        minor: u8,
    },
    Query {
        requested_id: String,
    },
    NewMessage(ChatMessage),
    Meta(BTreeMap<String, String>),
    Unknown {
        kind: u8,
    },
}

impl ProtocolMessage {
    /// A WELCOME advertising the current protocol version.
    pub fn welcome(root: impl Into<String>, recent: Vec<String>) -> Self {
        ProtocolMessage::Welcome {
            root: root.into(),
            recent,
            major: PROTOCOL_MAJOR,
            minor: PROTOCOL_MINOR,
        }
    }

    pub fn query(requested_id: impl Into<String>) -> Self {
        ProtocolMessage::Query {
            requested_id: requested_id.into(),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            ProtocolMessage::Welcome { .. } => Kind::Welcome,
            ProtocolMessage::Query { .. } => Kind::Query,
            ProtocolMessage::NewMessage(_) => Kind::NewMessage,
            ProtocolMessage::Meta(_) => Kind::Meta,
            ProtocolMessage::Unknown { kind } => Kind::Unknown(*kind),
        }
    }

    /// Checks that every field required by the envelope's kind is populated.
    pub fn is_valid(&self) -> bool {
        match self {
            ProtocolMessage::Welcome {
                root, major, minor, ..
            } => !root.is_empty() && (*major, *minor) != (0, 0),
            ProtocolMessage::Query { requested_id } => !requested_id.is_empty(),
            // An empty parent is a root message and is allowed.
            ProtocolMessage::NewMessage(message) => {
                !message.author.is_empty()
                    && !message.content.is_empty()
                    && message.created_at != 0
            }
            ProtocolMessage::Meta(_) => true,
            ProtocolMessage::Unknown { .. } => false,
        }
    }

    /// Serializes the envelope into a newline-terminated wire frame.
    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        if let ProtocolMessage::Unknown { kind } = self {
            return Err(ProtocolError::UnknownKind(*kind));
        }
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(Frame(line.into()))
    }

    /// Parses one envelope from a JSON document.
    pub fn decode(input: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(input)?)
    }
}

/// The JSON form of the envelope, or an empty string for unknown kinds.
impl fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encode() {
            Ok(frame) => f.write_str(frame.as_str().trim_end()),
            Err(_) => Ok(()),
        }
    }
}

/// An encoded envelope, newline included, shared cheaply between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Arc<str>);

impl Frame {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// Flat wire layout. Every field except `Type` is optional so that each kind
/// writes only its own fields.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "Type")]
    kind: u8,
    #[serde(rename = "Root", default, skip_serializing_if = "Option::is_none")]
    root: Option<String>,
    #[serde(rename = "Recent", default, skip_serializing_if = "Option::is_none")]
    recent: Option<Vec<String>>,
    #[serde(rename = "Major", default, skip_serializing_if = "Option::is_none")]
    major: Option<u8>,
    #[serde(rename = "Minor", default, skip_serializing_if = "Option::is_none")]
    minor: Option<u8>,
    #[serde(rename = "UUID", default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "Parent", default, skip_serializing_if = "Option::is_none")]
    parent: Option<String>,
    #[serde(rename = "Content", default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(rename = "Username", default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(rename = "Timestamp", default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
    #[serde(rename = "Meta", default, skip_serializing_if = "Option::is_none")]
    meta: Option<BTreeMap<String, String>>,
}

impl From<ProtocolMessage> for WireEnvelope {
    fn from(message: ProtocolMessage) -> Self {
        let kind = message.kind().code();
        match message {
            ProtocolMessage::Welcome {
                root,
                recent,
                major,
                minor,
            } => WireEnvelope {
                kind,
                root: Some(root),
                recent: Some(recent),
                major: Some(major),
                minor: Some(minor),
                ..Default::default()
            },
            ProtocolMessage::Query { requested_id } => WireEnvelope {
                kind,
                id: Some(requested_id),
                ..Default::default()
            },
            ProtocolMessage::NewMessage(message) => WireEnvelope {
                kind,
                id: Some(message.id),
                parent: Some(message.parent_id),
                content: Some(message.content),
                username: Some(message.author),
                timestamp: Some(message.created_at),
                ..Default::default()
            },
            ProtocolMessage::Meta(meta) => WireEnvelope {
                kind,
                meta: Some(meta),
                ..Default::default()
            },
            ProtocolMessage::Unknown { .. } => WireEnvelope {
                kind,
                ..Default::default()
            },
        }
    }
}

impl TryFrom<WireEnvelope> for ProtocolMessage {
    type Error = ProtocolError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let message = match wire.kind {
            WELCOME_TYPE => ProtocolMessage::Welcome {
                root: wire.root.unwrap_or_default(),
                recent: wire.recent.ok_or(ProtocolError::MissingField {
                    kind: "WELCOME",
                    field: "Recent",
                })?,
                major: wire.major.unwrap_or_default(),
                minor: wire.minor.unwrap_or_default(),
            },
            QUERY_TYPE => ProtocolMessage::Query {
                requested_id: wire.id.unwrap_or_default(),
            },
            NEW_MESSAGE_TYPE => ProtocolMessage::NewMessage(ChatMessage {
                id: wire.id.unwrap_or_default(),
                parent_id: wire.parent.unwrap_or_default(),
                content: wire.content.unwrap_or_default(),
                author: wire.username.unwrap_or_default(),
                created_at: wire.timestamp.unwrap_or_default(),
            }),
            META_TYPE => ProtocolMessage::Meta(wire.meta.ok_or(ProtocolError::MissingField {
                kind: "META",
                field: "Meta",
            })?),
            kind => ProtocolMessage::Unknown { kind },
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELCOME_ONLY: &[&str] = &["Root", "Recent", "Major", "Minor"];
    const NEW_ONLY: &[&str] = &["Content", "Parent", "Username", "Timestamp"];

    fn welcome() -> ProtocolMessage {
        ProtocolMessage::welcome("root", vec!["1".into(), "2".into(), "3".into(), "4".into()])
    }

    fn new_message() -> ProtocolMessage {
        ProtocolMessage::NewMessage(ChatMessage {
            id: "1".into(),
            parent_id: "2".into(),
            content: "a test message".into(),
            author: "testopheles".into(),
            created_at: chrono::Utc::now().timestamp(),
        })
    }

    fn query() -> ProtocolMessage {
        ProtocolMessage::query("1")
    }

    fn encoded(message: &ProtocolMessage) -> String {
        message.encode().expect("encode").as_str().to_string()
    }

    fn contains_any(input: &str, fields: &[&str]) -> bool {
        fields.iter().any(|field| input.contains(&format!("\"{field}\"")))
    }

    fn contains_all(input: &str, fields: &[&str]) -> bool {
        fields.iter().all(|field| input.contains(&format!("\"{field}\"")))
    }

    #[test]
    fn welcome_writes_only_welcome_fields() {
        let json = encoded(&welcome());
        assert!(contains_all(&json, WELCOME_ONLY), "{json}");
        assert!(contains_all(&json, &["Type"]));
        assert!(!contains_any(&json, NEW_ONLY), "{json}");
        assert!(!contains_any(&json, &["UUID", "Meta"]));
        assert!(json.ends_with('\n'));
    }

    #[test]
    fn new_message_writes_only_message_fields() {
        let json = encoded(&new_message());
        assert!(contains_all(&json, NEW_ONLY), "{json}");
        assert!(contains_all(&json, &["Type", "UUID"]));
        assert!(!contains_any(&json, WELCOME_ONLY), "{json}");
    }

    #[test]
    fn root_message_still_writes_parent() {
        let mut message = ChatMessage::new("top level");
        message.author = "alice".into();
        message.assign_id();
        let json = encoded(&ProtocolMessage::NewMessage(message));
        assert!(json.contains("\"Parent\":\"\""), "{json}");
    }

    #[test]
    fn query_writes_only_type_and_id() {
        let json = encoded(&query());
        assert!(contains_all(&json, &["Type", "UUID"]));
        assert!(!contains_any(&json, WELCOME_ONLY), "{json}");
        assert!(!contains_any(&json, NEW_ONLY), "{json}");
    }

    #[test]
    fn unknown_kind_cannot_be_encoded() {
        let unknown = ProtocolMessage::Unknown { kind: 99 };
        assert!(matches!(unknown.encode(), Err(ProtocolError::UnknownKind(99))));
        assert_eq!(unknown.to_string(), "");
        assert!(!welcome().to_string().is_empty());
    }

    #[test]
    fn validity_per_kind() {
        assert!(welcome().is_valid());
        assert!(query().is_valid());
        assert!(new_message().is_valid());
        assert!(ProtocolMessage::Meta(BTreeMap::new()).is_valid());
        assert!(!ProtocolMessage::Unknown { kind: 99 }.is_valid());

        assert!(!ProtocolMessage::welcome("", vec![]).is_valid());
        assert!(ProtocolMessage::welcome("root", vec![]).is_valid());
        let unversioned = ProtocolMessage::Welcome {
            root: "root".into(),
            recent: vec![],
            major: 0,
            minor: 0,
        };
        assert!(!unversioned.is_valid());
        assert!(!ProtocolMessage::query("").is_valid());
    }

    #[test]
    fn new_message_validity_requires_author_content_and_time() {
        let ProtocolMessage::NewMessage(base) = new_message() else {
            unreachable!()
        };
        let root = ChatMessage {
            parent_id: String::new(),
            ..base.clone()
        };
        assert!(ProtocolMessage::NewMessage(root).is_valid());

        for broken in [
            ChatMessage { author: String::new(), ..base.clone() },
            ChatMessage { content: String::new(), ..base.clone() },
            ChatMessage { created_at: 0, ..base.clone() },
        ] {
            assert!(!ProtocolMessage::NewMessage(broken).is_valid());
        }
    }

    #[test]
    fn valid_kinds_survive_the_wire() {
        let mut meta = BTreeMap::new();
        meta.insert("client".to_string(), "arbor".to_string());
        for message in [welcome(), query(), new_message(), ProtocolMessage::Meta(meta)] {
            let frame = message.encode().expect("encode");
            let decoded = ProtocolMessage::decode(frame.as_str()).expect("decode");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn recent_ids_compare_element_wise() {
        let reordered =
            ProtocolMessage::welcome("root", vec!["2".into(), "1".into(), "3".into(), "4".into()]);
        assert_ne!(welcome(), reordered);
        assert_ne!(welcome(), ProtocolMessage::welcome("root", vec!["1".into()]));
    }

    #[test]
    fn unknown_kind_decodes_but_is_invalid() {
        let decoded = ProtocolMessage::decode(r#"{"Type":99,"UUID":"x"}"#).expect("decode");
        assert_eq!(decoded, ProtocolMessage::Unknown { kind: 99 });
        assert_eq!(decoded.kind(), Kind::Unknown(99));
        assert!(!decoded.is_valid());
    }

    #[test]
    fn structurally_missing_fields_are_rejected() {
        assert!(ProtocolMessage::decode(r#"{"Type":0,"Root":"r","Major":0,"Minor":1}"#).is_err());
        assert!(ProtocolMessage::decode(r#"{"Type":3}"#).is_err());
        assert!(ProtocolMessage::decode(r#"{"Root":"r"}"#).is_err());
        assert!(ProtocolMessage::decode("not json").is_err());
    }

    #[test]
    fn sparse_new_message_decodes_as_invalid() {
        let decoded = ProtocolMessage::decode(r#"{"Type":2,"UUID":"x"}"#).expect("decode");
        assert_eq!(decoded.kind(), Kind::NewMessage);
        assert!(!decoded.is_valid());
    }

    #[test]
    fn query_ignores_stray_message_fields() {
        let decoded = ProtocolMessage::decode(r#"{"Type":1,"UUID":"x","Content":"ignored"}"#)
            .expect("decode");
        assert_eq!(decoded, ProtocolMessage::query("x"));
    }
}
