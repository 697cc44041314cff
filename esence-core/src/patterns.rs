//! Pattern extraction from correction history, following
//! `esense/essence/patterns.py`.
//!
//! Triggered every fifth correction (see [`crate::queue`]'s event
//! emission); re-reads the last few corrections, asks the provider to name
//! recurring edits, and appends any genuinely new ones to the store.

use serde::Deserialize;

use crate::provider::{HistoryTurn, Provider, Role};
use crate::store::{Pattern, Store, StoreError};

const DEFAULT_LAST_N: usize = 5;
const DEFAULT_CONFIDENCE: f64 = 0.5;
const MAX_TOKENS: u32 = 1024;

const EXTRACTION_SYSTEM_PROMPT: &str = "You analyze edits a human owner made to proposed replies and name the \
consistent correction patterns you observe. Respond with a JSON array of \
objects, each with \"description\", \"examples\" (array of strings), and \
\"confidence\" (0 to 1). Respond with nothing but the JSON array.";

#[derive(Debug, thiserror::Error)]
pub enum PatternExtractionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),
}

#[derive(Deserialize)]
struct ExtractedPattern {
    description: String,
    #[serde(default)]
    examples: Vec<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(stripped) = trimmed.strip_prefix("```json") {
        stripped.strip_suffix("```").unwrap_or(stripped).trim()
    } else if let Some(stripped) = trimmed.strip_prefix("```") {
        stripped.strip_suffix("```").unwrap_or(stripped).trim()
    } else {
        trimmed
    }
}

/// Extract and persist new patterns from recent corrections. Returns the
/// number of patterns added.
pub async fn extract_patterns(
    store: &Store,
    provider: &dyn Provider,
    last_n: Option<usize>,
) -> Result<usize, PatternExtractionError> {
    let corrections = store.read_corrections()?;
    if corrections.is_empty() {
        return Ok(0);
    }

    let last_n = last_n.unwrap_or(DEFAULT_LAST_N);
    let recent = &corrections[corrections.len().saturating_sub(last_n)..];
    let meaningful: Vec<_> = recent.iter().filter(|c| c.original != c.edited).collect();
    if meaningful.is_empty() {
        return Ok(0);
    }

    let prompt_body =
        serde_json::to_string(&meaningful).map_err(|e| PatternExtractionError::Store(StoreError::Json {
            path: store.root().join("corrections.log"),
            source: e,
        }))?;
    let history = vec![HistoryTurn {
        role: Role::User,
        content: format!("Corrections:\n{prompt_body}"),
    }];

    let completion = provider
        .complete(EXTRACTION_SYSTEM_PROMPT, &history, MAX_TOKENS)
        .await?;

    let cleaned = strip_code_fence(&completion.text);
    let parsed: Vec<ExtractedPattern> = match serde_json::from_str(cleaned) {
        Ok(list) => list,
        Err(_) => return Ok(0),
    };

    let existing = store.read_patterns()?;
    let existing_descriptions: std::collections::HashSet<String> =
        existing.iter().map(|p| p.description.to_lowercase()).collect();

    let mut added = 0;
    let mut all = existing;
    for candidate in parsed {
        if existing_descriptions.contains(&candidate.description.to_lowercase()) {
            continue;
        }
        all.push(Pattern {
            description: candidate.description,
            examples: candidate.examples,
            confidence: candidate.confidence.unwrap_or(DEFAULT_CONFIDENCE),
            extracted_at: chrono::Utc::now(),
        });
        added += 1;
    }

    if added > 0 {
        store.write_patterns(&all)?;
    }
    Ok(added)
}
