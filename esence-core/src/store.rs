//! Content-addressed, file-based persistent store.
//!
//! Layout under the store root, following `esence/essence/store.py`:
//! `identity.json`, `did.json`, `keys/`, `threads/*.json`, `patterns.json`,
//! `context.md`, `corrections.log` (NDJSON), `peers.json`, `budget.json`,
//! `presence.json`. Every read of a file that hasn't been created yet
//! returns an empty/default shape, except the identity document: per the
//! node's startup contract, a store with neither `did.json` nor
//! `identity.json` is a hard configuration error, not an empty identity.

use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no identity found in store at {0}: neither did.json nor identity.json exists")]
    NoIdentity(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub monthly_limit_tokens: u64,
    pub used_tokens: u64,
    pub donation_pct: u8,
    pub calls_total: u64,
    pub last_reset: chrono::DateTime<Utc>,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            monthly_limit_tokens: 500_000,
            used_tokens: 0,
            donation_pct: 10,
            calls_total: 0,
            last_reset: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Available,
    Moderate,
    Absent,
    Dnd,
}

impl Default for Mood {
    fn default() -> Self {
        Mood::Moderate
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    #[serde(default)]
    pub mood: Mood,
    #[serde(default)]
    pub auto_approve: bool,
}

impl Default for Presence {
    fn default() -> Self {
        Self {
            mood: Mood::default(),
            auto_approve: false,
        }
    }
}

/// A single correction record appended to `corrections.log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub thread_id: String,
    pub original: String,
    pub edited: String,
    #[serde(default = "Utc::now")]
    pub timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub description: String,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    pub extracted_at: chrono::DateTime<Utc>,
}

fn default_confidence() -> f64 {
    0.5
}

pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn json_err(&self, path: &Path, source: serde_json::Error) -> StoreError {
        StoreError::Json {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Create the directory structure and default files, skipping any that
    /// already exist.
    pub fn initialize(&self, identity_document: &Value) -> Result<(), StoreError> {
        std::fs::create_dir_all(self.root.join("threads")).map_err(|e| self.io_err(&self.root, e))?;
        std::fs::create_dir_all(self.root.join("keys")).map_err(|e| self.io_err(&self.root, e))?;

        let did_path = self.root.join("did.json");
        if !did_path.exists() {
            self.write_json(&did_path, identity_document)?;
        }
        self.write_if_absent(&self.root.join("patterns.json"), "[]\n")?;
        self.write_if_absent(
            &self.root.join("context.md"),
            "# Context\n\nNotes the node has learned about its owner's preferences.\n",
        )?;
        self.write_if_absent(&self.root.join("corrections.log"), "")?;
        self.write_if_absent(&self.root.join("peers.json"), "[]\n")?;

        let budget_path = self.root.join("budget.json");
        if !budget_path.exists() {
            self.write_budget(&Budget::default())?;
        }
        let presence_path = self.root.join("presence.json");
        if !presence_path.exists() {
            self.write_presence(&Presence::default())?;
        }
        Ok(())
    }

    fn write_if_absent(&self, path: &Path, contents: &str) -> Result<(), StoreError> {
        if !path.exists() {
            std::fs::write(path, contents).map_err(|e| self.io_err(path, e))?;
        }
        Ok(())
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(value).map_err(|e| self.json_err(path, e))?;
        std::fs::write(path, text).map_err(|e| self.io_err(path, e))
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path).map_err(|e| self.io_err(path, e))?;
        let value = serde_json::from_str(&text).map_err(|e| self.json_err(path, e))?;
        Ok(Some(value))
    }

    /// The published identity document. A hard error if neither `did.json`
    /// nor `identity.json` exists — an un-bootstrapped store is a
    /// misconfiguration, not an empty identity.
    pub fn read_identity(&self) -> Result<Value, StoreError> {
        let did_path = self.root.join("did.json");
        if did_path.exists() {
            return self
                .read_json(&did_path)
                .map(|v: Option<Value>| v.unwrap_or(Value::Null));
        }
        let identity_path = self.root.join("identity.json");
        if identity_path.exists() {
            return self
                .read_json(&identity_path)
                .map(|v: Option<Value>| v.unwrap_or(Value::Null));
        }
        Err(StoreError::NoIdentity(self.root.clone()))
    }

    pub fn write_identity(&self, document: &Value) -> Result<(), StoreError> {
        self.write_json(&self.root.join("did.json"), document)
    }

    pub fn read_patterns(&self) -> Result<Vec<Pattern>, StoreError> {
        Ok(self.read_json(&self.root.join("patterns.json"))?.unwrap_or_default())
    }

    pub fn write_patterns(&self, patterns: &[Pattern]) -> Result<(), StoreError> {
        self.write_json(&self.root.join("patterns.json"), patterns)
    }

    pub fn add_pattern(&self, pattern: Pattern) -> Result<(), StoreError> {
        let mut patterns = self.read_patterns()?;
        patterns.push(pattern);
        self.write_patterns(&patterns)
    }

    pub fn read_context(&self) -> Result<String, StoreError> {
        let path = self.root.join("context.md");
        if !path.exists() {
            return Ok(String::new());
        }
        std::fs::read_to_string(&path).map_err(|e| self.io_err(&path, e))
    }

    pub fn write_context(&self, content: &str) -> Result<(), StoreError> {
        let path = self.root.join("context.md");
        std::fs::write(&path, content).map_err(|e| self.io_err(&path, e))
    }

    pub fn append_context(&self, section: &str, content: &str) -> Result<(), StoreError> {
        let mut existing = self.read_context()?;
        existing.push_str(&format!("\n## {section}\n\n{content}\n"));
        self.write_context(&existing)
    }

    pub fn append_correction(&self, correction: &Correction) -> Result<(), StoreError> {
        let path = self.root.join("corrections.log");
        let line = serde_json::to_string(correction).map_err(|e| self.json_err(&path, e))?;
        let mut existing = if path.exists() {
            std::fs::read_to_string(&path).map_err(|e| self.io_err(&path, e))?
        } else {
            String::new()
        };
        existing.push_str(&line);
        existing.push('\n');
        std::fs::write(&path, existing).map_err(|e| self.io_err(&path, e))
    }

    pub fn read_corrections(&self) -> Result<Vec<Correction>, StoreError> {
        let path = self.root.join("corrections.log");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path).map_err(|e| self.io_err(&path, e))?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(|e| self.json_err(&path, e)))
            .collect()
    }

    pub fn read_peers(&self) -> Result<Vec<crate::peers::PeerRecord>, StoreError> {
        Ok(self.read_json(&self.root.join("peers.json"))?.unwrap_or_default())
    }

    pub fn write_peers(&self, peers: &[crate::peers::PeerRecord]) -> Result<(), StoreError> {
        self.write_json(&self.root.join("peers.json"), peers)
    }

    pub fn read_budget(&self) -> Result<Budget, StoreError> {
        Ok(self.read_json(&self.root.join("budget.json"))?.unwrap_or_default())
    }

    pub fn write_budget(&self, budget: &Budget) -> Result<(), StoreError> {
        self.write_json(&self.root.join("budget.json"), budget)
    }

    /// Reset `used_tokens`/`calls_total` if `last_reset` falls in an earlier
    /// calendar month than now, then record this call's usage.
    pub fn record_usage(&self, tokens_used: u64) -> Result<Budget, StoreError> {
        let mut budget = self.reset_budget_if_new_month()?;
        budget.used_tokens += tokens_used;
        budget.calls_total += 1;
        self.write_budget(&budget)?;
        Ok(budget)
    }

    fn reset_budget_if_new_month(&self) -> Result<Budget, StoreError> {
        let mut budget = self.read_budget()?;
        let now = Utc::now();
        if budget.last_reset.year() < now.year()
            || (budget.last_reset.year() == now.year() && budget.last_reset.month() < now.month())
        {
            budget.used_tokens = 0;
            budget.calls_total = 0;
            budget.last_reset = now;
            self.write_budget(&budget)?;
        }
        Ok(budget)
    }

    /// Whether usage is over the monthly limit, after applying the
    /// monthly-reset rule.
    pub fn is_over_budget(&self) -> Result<bool, StoreError> {
        let budget = self.reset_budget_if_new_month()?;
        Ok(budget.used_tokens >= budget.monthly_limit_tokens)
    }

    pub fn read_presence(&self) -> Result<Presence, StoreError> {
        Ok(self.read_json(&self.root.join("presence.json"))?.unwrap_or_default())
    }

    pub fn write_presence(&self, presence: &Presence) -> Result<(), StoreError> {
        self.write_json(&self.root.join("presence.json"), presence)
    }

    pub fn mood(&self) -> Result<Mood, StoreError> {
        Ok(self.read_presence()?.mood)
    }

    pub fn set_mood(&self, mood: Mood) -> Result<(), StoreError> {
        let mut presence = self.read_presence()?;
        presence.mood = mood;
        self.write_presence(&presence)
    }

    pub fn auto_approve(&self) -> Result<bool, StoreError> {
        Ok(self.read_presence()?.auto_approve)
    }

    pub fn set_auto_approve(&self, enabled: bool) -> Result<(), StoreError> {
        let mut presence = self.read_presence()?;
        presence.auto_approve = enabled;
        self.write_presence(&presence)
    }

    pub fn thread_path(&self, thread_id: &str) -> PathBuf {
        self.root.join("threads").join(format!("{thread_id}.json"))
    }

    pub fn read_thread(&self, thread_id: &str) -> Result<Vec<Value>, StoreError> {
        Ok(self.read_json(&self.thread_path(thread_id))?.unwrap_or_default())
    }

    pub fn write_thread(&self, thread_id: &str, messages: &[Value]) -> Result<(), StoreError> {
        self.write_json(&self.thread_path(thread_id), messages)
    }

    pub fn append_to_thread(&self, thread_id: &str, message: Value) -> Result<(), StoreError> {
        let mut messages = self.read_thread(thread_id)?;
        messages.push(message);
        self.write_thread(thread_id, &messages)
    }

    /// Delete a thread's file. A no-op if it doesn't exist.
    pub fn delete_thread(&self, thread_id: &str) -> Result<(), StoreError> {
        let path = self.thread_path(thread_id);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| self.io_err(&path, e))?;
        }
        Ok(())
    }

    pub fn list_threads(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join("threads");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| self.io_err(&dir, e))? {
            let entry = entry.map_err(|e| self.io_err(&dir, e))?;
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
