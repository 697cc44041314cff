//! Ed25519 key pair, identifier derivation, signing, and verification.
//!
//! Key handling follows `freeq-server/src/policy/credentials.rs`: sign/verify
//! over a canonical byte string, base64url-no-pad signatures. Persistence
//! (PEM private/public keys, 0600 permissions on the private key, a published
//! identity document) follows `esence/core/identity.py`'s `save`/`load`.

use std::path::Path;
use std::sync::LazyLock;

use base64::Engine;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// `did:wba:<host>:<name>` where `<host>` may contain a percent-encoded port.
pub static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^did:wba:[A-Za-z0-9._:%-]+:[A-Za-z0-9_-]+$").expect("valid regex"));

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key encoding error: {0}")]
    KeyEncoding(String),
    #[error("no identity found at {0}")]
    NotFound(String),
    #[error("malformed identity document: {0}")]
    MalformedDocument(#[from] serde_json::Error),
}

/// A verification method entry as published in a DID document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub method_type: String,
    pub controller: String,
    #[serde(rename = "publicKeyMultibase")]
    pub public_key_multibase: String,
}

/// The published identity document: a stable JSON schema binding the
/// identifier to its verification key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityDocument {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub id: String,
    #[serde(rename = "verificationMethod")]
    pub verification_method: Vec<VerificationMethod>,
    pub authentication: Vec<String>,
    #[serde(rename = "assertionMethod")]
    pub assertion_method: Vec<String>,
}

impl IdentityDocument {
    /// Public key (base64url, no `z` prefix) of the first verification method.
    pub fn first_public_key_b64(&self) -> Option<String> {
        self.verification_method
            .first()
            .and_then(|vm| vm.public_key_multibase.strip_prefix('z'))
            .map(|s| s.to_string())
    }
}

fn b64url_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn b64url_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s)
}

/// An Ed25519 key pair plus its self-certifying identifier.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    did: String,
}

impl Identity {
    pub fn generate(node_name: &str, host: &str) -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let did = format!("did:wba:{host}:{node_name}");
        Self { signing_key, did }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Raw 32-byte public key, base64url-no-pad, no multibase prefix — the
    /// encoding `peer_intro.public_key` uses.
    pub fn public_key_b64(&self) -> String {
        b64url_encode(self.verifying_key().as_bytes())
    }

    pub fn sign(&self, data: &[u8]) -> String {
        let sig: Signature = self.signing_key.sign(data);
        b64url_encode(&sig.to_bytes())
    }

    pub fn verify(&self, data: &[u8], signature_b64: &str) -> bool {
        Self::verify_with(&self.public_key_b64(), data, signature_b64)
    }

    /// Verify against a supplied public key. Never raises: any decoding or
    /// cryptographic failure is reported as `false`.
    pub fn verify_with(public_key_b64: &str, data: &[u8], signature_b64: &str) -> bool {
        let verify = || -> Result<bool, ()> {
            let pub_bytes = b64url_decode(public_key_b64).map_err(|_| ())?;
            let pub_bytes: [u8; 32] = pub_bytes.try_into().map_err(|_| ())?;
            let verifying_key = VerifyingKey::from_bytes(&pub_bytes).map_err(|_| ())?;
            let sig_bytes = b64url_decode(signature_b64).map_err(|_| ())?;
            let signature = Signature::from_slice(&sig_bytes).map_err(|_| ())?;
            Ok(verifying_key.verify(data, &signature).is_ok())
        };
        verify().unwrap_or(false)
    }

    pub fn to_did_document(&self) -> IdentityDocument {
        let vm_id = format!("{}#key-1", self.did);
        let public_key_multibase = format!("z{}", self.public_key_b64());
        IdentityDocument {
            context: vec![
                "https://www.w3.org/ns/did/v1".to_string(),
                "https://w3id.org/security/suites/ed25519-2020/v1".to_string(),
            ],
            id: self.did.clone(),
            verification_method: vec![VerificationMethod {
                id: vm_id.clone(),
                method_type: "Ed25519VerificationKey2020".to_string(),
                controller: self.did.clone(),
                public_key_multibase,
            }],
            authentication: vec![vm_id.clone()],
            assertion_method: vec![vm_id],
        }
    }

    /// Write PEM private key (0600), PEM public key, and the identity document.
    pub fn save(&self, store_dir: &Path) -> Result<(), IdentityError> {
        let keys_dir = store_dir.join("keys");
        std::fs::create_dir_all(&keys_dir)?;

        let private_pem = self
            .signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| IdentityError::KeyEncoding(e.to_string()))?;
        let private_path = keys_dir.join("private.pem");
        std::fs::write(&private_path, private_pem.as_bytes())?;
        set_owner_only_permissions(&private_path)?;

        let public_pem = pem_encode_public_key(&self.verifying_key())?;
        std::fs::write(keys_dir.join("public.pem"), public_pem)?;

        let doc = self.to_did_document();
        std::fs::write(store_dir.join("did.json"), serde_json::to_string_pretty(&doc)?)?;

        Ok(())
    }

    /// Load the private key from PEM/PKCS-8 and the identifier from the
    /// published identity document (falling back to `identity.json`).
    pub fn load(store_dir: &Path) -> Result<Self, IdentityError> {
        let private_path = store_dir.join("keys").join("private.pem");
        let pem = std::fs::read_to_string(&private_path)?;
        let signing_key = SigningKey::from_pkcs8_pem(&pem)
            .map_err(|e| IdentityError::KeyEncoding(e.to_string()))?;

        let did_path = store_dir.join("did.json");
        let identity_path = store_dir.join("identity.json");
        let did = if did_path.exists() {
            let doc: IdentityDocument = serde_json::from_str(&std::fs::read_to_string(did_path)?)?;
            doc.id
        } else if identity_path.exists() {
            let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(identity_path)?)?;
            value
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| IdentityError::NotFound(store_dir.display().to_string()))?
                .to_string()
        } else {
            return Err(IdentityError::NotFound(store_dir.display().to_string()));
        };

        Ok(Self { signing_key, did })
    }

    pub fn load_or_generate(store_dir: &Path, node_name: &str, host: &str) -> Result<Self, IdentityError> {
        let private_path = store_dir.join("keys").join("private.pem");
        if private_path.exists() {
            Self::load(store_dir)
        } else {
            let identity = Self::generate(node_name, host);
            identity.save(store_dir)?;
            Ok(identity)
        }
    }

    /// Re-derive the identifier for a new host, rewrite the identity
    /// document, and keep the key pair unchanged.
    pub fn update_host(&mut self, new_host: &str, store_dir: &Path) -> Result<(), IdentityError> {
        let name = self
            .did
            .rsplit(':')
            .next()
            .expect("identifier always has a name segment")
            .to_string();
        self.did = format!("did:wba:{new_host}:{name}");
        let doc = self.to_did_document();
        std::fs::write(store_dir.join("did.json"), serde_json::to_string_pretty(&doc)?)?;

        // Round-trip a payload to verify keys survived the host change.
        let probe = b"esence-update-host-probe";
        let sig = self.sign(probe);
        debug_assert!(self.verify(probe, &sig));
        Ok(())
    }
}

fn pem_encode_public_key(key: &VerifyingKey) -> Result<String, IdentityError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| IdentityError::KeyEncoding(e.to_string()))
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sign_then_verify_round_trips() {
        let identity = Identity::generate("node0", "localhost%3A7777");
        let data = b"hello peer";
        let sig = identity.sign(data);
        assert!(identity.verify(data, &sig));
    }

    #[test]
    fn verify_with_wrong_key_fails_closed() {
        let a = Identity::generate("alice", "example.com");
        let b = Identity::generate("bob", "example.org");
        let sig = a.sign(b"payload");
        assert!(!Identity::verify_with(&b.public_key_b64(), b"payload", &sig));
    }

    #[test]
    fn verify_with_garbage_never_panics() {
        assert!(!Identity::verify_with("not-base64!!", b"x", "also-not-base64"));
    }

    #[test]
    fn save_and_load_round_trips_identity() {
        let dir = tempdir().unwrap();
        let identity = Identity::generate("node0", "localhost%3A7777");
        identity.save(dir.path()).unwrap();
        let loaded = Identity::load(dir.path()).unwrap();
        assert_eq!(identity.did(), loaded.did());
        let sig = loaded.sign(b"probe");
        assert!(identity.verify(b"probe", &sig));
    }

    #[test]
    fn update_host_preserves_keys_and_changes_identifier() {
        let dir = tempdir().unwrap();
        let mut identity = Identity::generate("node0", "localhost%3A7777");
        identity.save(dir.path()).unwrap();
        let original_pub = identity.public_key_b64();

        identity.update_host("example.com", dir.path()).unwrap();
        assert_eq!(identity.did(), "did:wba:example.com:node0");
        assert_eq!(identity.public_key_b64(), original_pub);
    }

    #[test]
    fn identifier_regex_matches_spec_examples() {
        assert!(IDENTIFIER_RE.is_match("did:wba:localhost%3A7777:node0"));
        assert!(!IDENTIFIER_RE.is_match("did:wba:example.com"));
    }
}
