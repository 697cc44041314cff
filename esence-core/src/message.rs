//! Tagged message variants, canonical signable serialization, and validation.
//!
//! Mirrors the JCS-style canonicalization in `freeq-server/src/policy/canonical.rs`:
//! round-trip through `serde_json::Value`, sort object keys recursively, serialize
//! compact. That byte string is the sole input to sign/verify.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::IDENTIFIER_RE;

pub const PROTOCOL_VERSION: &str = "0.2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    PendingHumanReview,
    AutoApproved,
    Approved,
    Sent,
    Answered,
    Rejected,
}

impl Default for MessageStatus {
    fn default() -> Self {
        MessageStatus::PendingHumanReview
    }
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

fn default_thread_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Fields shared by every message variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonFields {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_thread_id")]
    pub thread_id: String,
    pub from_did: String,
    pub to_did: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default = "default_timestamp")]
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub proposed_reply: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl CommonFields {
    pub fn new(from_did: impl Into<String>, to_did: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            version: default_version(),
            thread_id: default_thread_id(),
            from_did: from_did.into(),
            to_did: to_did.into(),
            content: content.into(),
            status: MessageStatus::PendingHumanReview,
            timestamp: default_timestamp(),
            signature: None,
            proposed_reply: None,
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessageBody {
    #[serde(flatten)]
    pub common: CommonFields,
    #[serde(default)]
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadReplyBody {
    #[serde(flatten)]
    pub common: CommonFields,
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerIntroBody {
    #[serde(flatten)]
    pub common: CommonFields,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub known_peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityStatusBody {
    #[serde(flatten)]
    pub common: CommonFields,
    #[serde(default)]
    pub available_pct: f64,
    #[serde(default)]
    pub monthly_remaining: i64,
}

/// The message protocol's sum type, discriminated by `type`.
///
/// Parsing dispatches on the tag; an unrecognized tag fails to deserialize,
/// which is exactly "unknown `type` values are rejected".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    ThreadMessage(ThreadMessageBody),
    ThreadReply(ThreadReplyBody),
    PeerIntro(PeerIntroBody),
    CapacityStatus(CapacityStatusBody),
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid identifier: {0}")]
    IdentifierInvalid(String),
}

impl Message {
    pub fn common(&self) -> &CommonFields {
        match self {
            Message::ThreadMessage(b) => &b.common,
            Message::ThreadReply(b) => &b.common,
            Message::PeerIntro(b) => &b.common,
            Message::CapacityStatus(b) => &b.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut CommonFields {
        match self {
            Message::ThreadMessage(b) => &mut b.common,
            Message::ThreadReply(b) => &mut b.common,
            Message::PeerIntro(b) => &mut b.common,
            Message::CapacityStatus(b) => &mut b.common,
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            Message::ThreadMessage(_) => "thread_message",
            Message::ThreadReply(_) => "thread_reply",
            Message::PeerIntro(_) => "peer_intro",
            Message::CapacityStatus(_) => "capacity_status",
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.common().thread_id
    }

    pub fn from_did(&self) -> &str {
        &self.common().from_did
    }

    pub fn to_did(&self) -> &str {
        &self.common().to_did
    }

    pub fn status(&self) -> MessageStatus {
        self.common().status
    }

    pub fn set_status(&mut self, status: MessageStatus) {
        self.common_mut().status = status;
    }

    pub fn signature(&self) -> Option<&str> {
        self.common().signature.as_deref()
    }

    pub fn set_signature(&mut self, signature: String) {
        self.common_mut().signature = Some(signature);
    }

    /// Parse a JSON value into the matching variant, dispatching on `type`.
    pub fn parse(value: Value) -> Result<Message, MessageError> {
        let message: Message = serde_json::from_value(value)?;
        message.validate()?;
        Ok(message)
    }

    /// Parse from already-serialized JSON text.
    pub fn parse_str(text: &str) -> Result<Message, MessageError> {
        let value: Value = serde_json::from_str(text)?;
        Message::parse(value)
    }

    fn validate(&self) -> Result<(), MessageError> {
        let common = self.common();
        if !IDENTIFIER_RE.is_match(&common.from_did) {
            return Err(MessageError::IdentifierInvalid(common.from_did.clone()));
        }
        if !IDENTIFIER_RE.is_match(&common.to_did) {
            return Err(MessageError::IdentifierInvalid(common.to_did.clone()));
        }
        if let Message::CapacityStatus(body) = self {
            let _ = body; // clamping is applied in the constructor/setter, not here
        }
        Ok(())
    }

    /// Canonical serialization of this message with `signature` cleared —
    /// the sole input to sign/verify.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut clone = self.clone();
        clone.common_mut().signature = None;
        let value = serde_json::to_value(&clone).expect("Message always serializes");
        canonicalize(&value).into_bytes()
    }
}

impl CapacityStatusBody {
    /// `available_pct` is always clamped to `[0, 100]`.
    pub fn with_clamped_pct(mut self) -> Self {
        self.available_pct = self.available_pct.clamp(0.0, 100.0);
        self
    }
}

/// Canonicalize a JSON value: sorted object keys, no insignificant whitespace.
pub fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| k.as_str());
            let mut result = String::from("{");
            for (i, (k, v)) in pairs.iter().enumerate() {
                if i > 0 {
                    result.push(',');
                }
                result.push_str(&serde_json::to_string(k).expect("string key serializes"));
                result.push(':');
                result.push_str(&canonicalize(v));
            }
            result.push('}');
            result
        }
        Value::Array(arr) => {
            let mut result = String::from("[");
            for (i, v) in arr.iter().enumerate() {
                if i > 0 {
                    result.push(',');
                }
                result.push_str(&canonicalize(v));
            }
            result.push(']');
            result
        }
        _ => serde_json::to_string(value).expect("primitive serializes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_thread_message() -> Message {
        Message::ThreadMessage(ThreadMessageBody {
            common: CommonFields::new("did:wba:other:bob", "did:wba:localhost%3A7777:node0", "Hola"),
            subject: "greeting".into(),
        })
    }

    #[test]
    fn signable_bytes_excludes_signature() {
        let mut m = sample_thread_message();
        let before = m.signable_bytes();
        m.set_signature("deadbeef".into());
        let after = m.signable_bytes();
        assert_eq!(before, after);
    }

    #[test]
    fn roundtrips_through_serialize_parse() {
        let m = sample_thread_message();
        let value = serde_json::to_value(&m).unwrap();
        let parsed = Message::parse(value).unwrap();
        assert_eq!(m.signable_bytes(), parsed.signable_bytes());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let value = serde_json::json!({
            "type": "smoke_signal",
            "from_did": "did:wba:a:b",
            "to_did": "did:wba:c:d",
            "content": "x",
        });
        assert!(Message::parse(value).is_err());
    }

    #[test]
    fn rejects_malformed_identifier() {
        let value = serde_json::json!({
            "type": "thread_message",
            "from_did": "not-a-did",
            "to_did": "did:wba:c:d",
            "content": "x",
            "subject": "s",
        });
        assert!(matches!(Message::parse(value), Err(MessageError::IdentifierInvalid(_))));
    }

    #[test]
    fn default_status_is_pending_review() {
        let m = sample_thread_message();
        assert_eq!(m.status(), MessageStatus::PendingHumanReview);
    }

    #[test]
    fn canonicalize_sorts_keys() {
        let v = serde_json::json!({"b": 1, "a": 2});
        assert_eq!(canonicalize(&v), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn capacity_status_clamps_pct() {
        let body = CapacityStatusBody {
            common: CommonFields::new("did:wba:a:b", "did:wba:c:d", ""),
            available_pct: 150.0,
            monthly_remaining: 10,
        }
        .with_clamped_pct();
        assert_eq!(body.available_pct, 100.0);
    }
}
