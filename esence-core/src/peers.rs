//! Per-peer trust scores, gossip selection and merge, following
//! `esence/protocol/peers.py`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Store, StoreError};

const DEFAULT_TRUST: f64 = 0.5;
const MAX_TRUST: f64 = 1.0;
const MIN_TRUST: f64 = 0.0;
const GOSSIP_MIN_TRUST: f64 = 0.4;
const GOSSIP_MAX_PEERS: usize = 20;
const NEW_PEER_FROM_GOSSIP_TRUST: f64 = 0.2;
const SUCCESS_DELTA: f64 = 0.02;
const FAILURE_DELTA: f64 = -0.05;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub did: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default = "default_trust")]
    pub trust_score: f64,
    #[serde(default)]
    pub message_count: u64,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub source: Option<String>,
}

fn default_trust() -> f64 {
    DEFAULT_TRUST
}

impl PeerRecord {
    fn new(did: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            did: did.into(),
            alias: None,
            trust_score: DEFAULT_TRUST,
            message_count: 0,
            added_at: now,
            updated_at: now,
            last_seen: None,
            blocked: false,
            source: None,
        }
    }

    /// `@name` of the identifier, or the alias if one is set.
    pub fn display_name(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        self.did
            .splitn(4, ':')
            .nth(3)
            .map(|name| format!("@{name}"))
            .unwrap_or_else(|| self.did.clone())
    }
}

/// Reads/mutates peer records through a `Store`, persisting each change.
pub struct PeerManager<'a> {
    store: &'a Store,
}

impl<'a> PeerManager<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn get_all(&self) -> Result<Vec<PeerRecord>, StoreError> {
        self.store.read_peers()
    }

    pub fn get_peer(&self, did: &str) -> Result<Option<PeerRecord>, StoreError> {
        Ok(self.get_all()?.into_iter().find(|p| p.did == did))
    }

    pub fn is_blocked(&self, did: &str) -> Result<bool, StoreError> {
        Ok(self.get_peer(did)?.map(|p| p.blocked).unwrap_or(false))
    }

    pub fn add_or_update(&self, did: &str, update: impl FnOnce(&mut PeerRecord)) -> Result<PeerRecord, StoreError> {
        let mut peers = self.get_all()?;
        let record = if let Some(existing) = peers.iter_mut().find(|p| p.did == did) {
            update(existing);
            existing.updated_at = Utc::now();
            existing.clone()
        } else {
            let mut record = PeerRecord::new(did);
            update(&mut record);
            peers.push(record.clone());
            record
        };
        self.store.write_peers(&peers)?;
        Ok(record)
    }

    pub fn remove(&self, did: &str) -> Result<(), StoreError> {
        let peers: Vec<_> = self.get_all()?.into_iter().filter(|p| p.did != did).collect();
        self.store.write_peers(&peers)
    }

    pub fn adjust_trust(&self, did: &str, delta: f64) -> Result<f64, StoreError> {
        let record = self.add_or_update(did, |p| {
            p.trust_score = (p.trust_score + delta).clamp(MIN_TRUST, MAX_TRUST);
        })?;
        Ok(record.trust_score)
    }

    pub fn record_interaction(&self, did: &str, successful: bool) -> Result<(), StoreError> {
        let delta = if successful { SUCCESS_DELTA } else { FAILURE_DELTA };
        self.add_or_update(did, |p| {
            p.trust_score = (p.trust_score + delta).clamp(MIN_TRUST, MAX_TRUST);
            p.message_count += 1;
            p.last_seen = Some(Utc::now());
        })?;
        Ok(())
    }

    pub fn trusted_peers(&self, min_trust: f64) -> Result<Vec<PeerRecord>, StoreError> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|p| p.trust_score >= min_trust && !p.blocked)
            .collect())
    }

    /// DIDs of the highest-trust peers, bounded in size for a gossip payload.
    pub fn gossip_payload(&self) -> Result<Vec<String>, StoreError> {
        let mut peers: Vec<_> = self
            .get_all()?
            .into_iter()
            .filter(|p| p.trust_score >= GOSSIP_MIN_TRUST && !p.blocked)
            .collect();
        peers.sort_by(|a, b| b.trust_score.partial_cmp(&a.trust_score).unwrap());
        peers.truncate(GOSSIP_MAX_PEERS);
        Ok(peers.into_iter().map(|p| p.did).collect())
    }

    /// Merge a gossiped peer list, skipping the source itself and peers
    /// already known. New peers start at a lower trust than a direct intro.
    pub fn merge_gossip(&self, incoming: &[String], source_did: &str) -> Result<usize, StoreError> {
        let mut peers = self.get_all()?;
        let known: std::collections::HashSet<_> = peers.iter().map(|p| p.did.clone()).collect();
        let mut added = 0;
        for did in incoming {
            if did == source_did || known.contains(did) {
                continue;
            }
            let mut record = PeerRecord::new(did.clone());
            record.trust_score = NEW_PEER_FROM_GOSSIP_TRUST;
            record.source = Some(source_did.to_string());
            peers.push(record);
            added += 1;
        }
        if added > 0 {
            self.store.write_peers(&peers)?;
        }
        Ok(added)
    }

    pub fn peer_count(&self) -> Result<usize, StoreError> {
        Ok(self.get_all()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        store.initialize(&serde_json::Value::Null).unwrap();
        (dir, store)
    }

    #[test]
    fn add_or_update_creates_with_default_trust() {
        let (_d, store) = store();
        let peers = PeerManager::new(&store);
        let record = peers.add_or_update("did:wba:a:b", |_| {}).unwrap();
        assert_eq!(record.trust_score, DEFAULT_TRUST);
    }

    #[test]
    fn record_interaction_clamps_trust() {
        let (_d, store) = store();
        let peers = PeerManager::new(&store);
        for _ in 0..50 {
            peers.record_interaction("did:wba:a:b", true).unwrap();
        }
        let record = peers.get_peer("did:wba:a:b").unwrap().unwrap();
        assert_eq!(record.trust_score, MAX_TRUST);
    }

    #[test]
    fn merge_gossip_skips_source_and_known() {
        let (_d, store) = store();
        let peers = PeerManager::new(&store);
        peers.add_or_update("did:wba:known:x", |_| {}).unwrap();
        let added = peers
            .merge_gossip(
                &[
                    "did:wba:known:x".to_string(),
                    "did:wba:new:y".to_string(),
                    "did:wba:source:z".to_string(),
                ],
                "did:wba:source:z",
            )
            .unwrap();
        assert_eq!(added, 1);
        let record = peers.get_peer("did:wba:new:y").unwrap().unwrap();
        assert_eq!(record.trust_score, NEW_PEER_FROM_GOSSIP_TRUST);
    }

    #[test]
    fn gossip_payload_sorted_desc_and_bounded() {
        let (_d, store) = store();
        let peers = PeerManager::new(&store);
        for i in 0..25 {
            peers
                .add_or_update(&format!("did:wba:h:p{i}"), |p| p.trust_score = 0.5 + (i as f64) * 0.01)
                .unwrap();
        }
        let payload = peers.gossip_payload().unwrap();
        assert_eq!(payload.len(), GOSSIP_MAX_PEERS);
        assert_eq!(payload[0], "did:wba:h:p24");
    }

    #[test]
    fn display_name_uses_alias_or_name_segment() {
        let (_d, store) = store();
        let peers = PeerManager::new(&store);
        let record = peers.add_or_update("did:wba:example.com:alice", |_| {}).unwrap();
        assert_eq!(record.display_name(), "@alice");
        let record = peers
            .add_or_update("did:wba:example.com:alice", |p| p.alias = Some("Alice".into()))
            .unwrap();
        assert_eq!(record.display_name(), "Alice");
    }
}
