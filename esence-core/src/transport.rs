//! Remote identifier resolution, outbound send, inbound verify.
//!
//! Grounded on `esence/protocol/transport.py`, with a 5-minute TTL added to
//! the resolution cache (the original caches without expiry).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::identity::{Identity, IdentityDocument};
use crate::message::Message;

const RESOLUTION_CACHE_TTL: Duration = Duration::from_secs(300);
const FRESHNESS_WINDOW_SECS: i64 = 300;
const RESOLUTION_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("malformed identifier: {0}")]
    MalformedIdentifier(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no verification method in identity document for {0}")]
    NoVerificationMethod(String),
}

struct CacheEntry {
    fetched_at: Instant,
    document: IdentityDocument,
}

/// Resolves `did:wba:<host>:<name>` identifiers to their published identity
/// document over HTTP, caching results for 5 minutes.
pub struct Transport {
    client: reqwest::Client,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn parse_host(did: &str) -> Result<String, TransportError> {
        let parts: Vec<&str> = did.split(':').collect();
        if parts.len() < 4 || parts[0] != "did" || parts[1] != "wba" {
            return Err(TransportError::MalformedIdentifier(did.to_string()));
        }
        Ok(parts[2].replace("%3A", ":"))
    }

    fn document_url(host: &str) -> String {
        if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
            format!("http://{host}/.well-known/did.json")
        } else {
            format!("https://{host}/.well-known/did.json")
        }
    }

    fn message_url(host: &str) -> String {
        if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
            format!("http://{host}/anp/message")
        } else {
            format!("https://{host}/anp/message")
        }
    }

    /// Resolve a remote identifier's published identity document, using a
    /// 5-minute cache.
    pub async fn resolve(&self, did: &str) -> Result<IdentityDocument, TransportError> {
        if let Some(entry) = self.cache.lock().expect("cache lock poisoned").get(did) {
            if entry.fetched_at.elapsed() < RESOLUTION_CACHE_TTL {
                return Ok(entry.document.clone());
            }
        }

        let host = Self::parse_host(did)?;
        let document: IdentityDocument = self
            .client
            .get(Self::document_url(&host))
            .timeout(RESOLUTION_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.cache.lock().expect("cache lock poisoned").insert(
            did.to_string(),
            CacheEntry {
                fetched_at: Instant::now(),
                document: document.clone(),
            },
        );
        Ok(document)
    }

    /// Sign and POST a message to its recipient. Never propagates a
    /// transport or signature error — failures are reported as `false`.
    pub async fn send_message(&self, message: &Message, identity: &Identity) -> bool {
        self.try_send_message(message, identity).await.unwrap_or(false)
    }

    async fn try_send_message(&self, message: &Message, identity: &Identity) -> Result<bool, TransportError> {
        self.resolve(message.to_did()).await?;
        let host = Self::parse_host(message.to_did())?;

        let mut signed = message.clone();
        let signature = identity.sign(&signed.signable_bytes());
        signed.set_signature(signature);

        let response = self
            .client
            .post(Self::message_url(&host))
            .json(&signed)
            .timeout(SEND_TIMEOUT)
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    /// Parse and verify an inbound payload. Returns the parsed message and
    /// whether its signature verified against the sender's published key.
    /// Never raises: any failure to parse, resolve, or verify is reported
    /// as `(message, false)` where possible, or propagated only when the
    /// payload itself cannot be parsed into a message at all.
    pub async fn receive_message(&self, payload: Value) -> Result<(Message, bool), crate::message::MessageError> {
        let message = Message::parse(payload)?;
        let valid = self.verify_signature(&message).await;
        Ok((message, valid))
    }

    async fn verify_signature(&self, message: &Message) -> bool {
        let Some(signature) = message.signature() else {
            return false;
        };
        if signature.is_empty() {
            return false;
        }
        if !Self::is_fresh(message) {
            return false;
        }
        let Ok(document) = self.resolve(message.from_did()).await else {
            return false;
        };
        let Some(public_key) = document.first_public_key_b64() else {
            return false;
        };
        Identity::verify_with(&public_key, &message.signable_bytes(), signature)
    }

    /// A message is fresh when its sender-set timestamp is within 300
    /// seconds of now, in either direction. An unparsable timestamp is
    /// treated as stale, not as a parse error — verification fails closed.
    fn is_fresh(message: &Message) -> bool {
        let Ok(sent_at) = chrono::DateTime::parse_from_rfc3339(&message.common().timestamp) else {
            return false;
        };
        let skew = (chrono::Utc::now() - sent_at.with_timezone(&chrono::Utc)).num_seconds();
        skew.abs() <= FRESHNESS_WINDOW_SECS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_rejects_non_wba_identifiers() {
        assert!(Transport::parse_host("did:key:zabc").is_err());
    }

    #[test]
    fn parse_host_decodes_percent_encoded_port() {
        let host = Transport::parse_host("did:wba:localhost%3A7777:node0").unwrap();
        assert_eq!(host, "localhost:7777");
    }

    #[test]
    fn document_url_uses_http_for_loopback() {
        assert_eq!(
            Transport::document_url("localhost:7777"),
            "http://localhost:7777/.well-known/did.json"
        );
        assert_eq!(
            Transport::document_url("example.com"),
            "https://example.com/.well-known/did.json"
        );
    }

    fn message_with_timestamp(timestamp: String) -> Message {
        use crate::message::{CommonFields, ThreadMessageBody};
        Message::ThreadMessage(ThreadMessageBody {
            common: CommonFields {
                timestamp,
                signature: Some("sig".into()),
                ..CommonFields::new("did:wba:a:b", "did:wba:c:d", "hi")
            },
            subject: "".into(),
        })
    }

    #[test]
    fn fresh_message_within_window_passes() {
        let message = message_with_timestamp(chrono::Utc::now().to_rfc3339());
        assert!(Transport::is_fresh(&message));
    }

    #[test]
    fn stale_message_outside_window_fails() {
        let old = chrono::Utc::now() - chrono::Duration::minutes(10);
        let message = message_with_timestamp(old.to_rfc3339());
        assert!(!Transport::is_fresh(&message));
    }

    #[test]
    fn unparsable_timestamp_fails_closed() {
        let message = message_with_timestamp("not-a-timestamp".into());
        assert!(!Transport::is_fresh(&message));
    }
}
