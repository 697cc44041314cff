//! Maturity score: a blend of correction volume, learned-pattern count, and
//! accumulated context, following `esense/essence/maturity.py`.

use crate::store::{Store, StoreError};

fn sigmoid_score(value: f64, midpoint: f64) -> f64 {
    1.0 / (1.0 + (-(value - midpoint) / (midpoint / 2.0)).exp())
}

/// `(corrections, patterns, context word count) -> [0, 1]` score, rounded to
/// four decimal places.
pub fn calculate_maturity(store: &Store) -> Result<f64, StoreError> {
    let corrections = store.read_corrections()?.len() as f64;
    let patterns = store.read_patterns()?.len() as f64;
    let word_count = store.read_context()?.split_whitespace().count() as f64;

    let corrections_score = sigmoid_score(corrections, 50.0) * 0.40;
    let patterns_score = sigmoid_score(patterns, 20.0) * 0.35;
    let context_score = sigmoid_score(word_count, 500.0) * 0.25;

    let total = (corrections_score + patterns_score + context_score).clamp(0.0, 1.0);
    Ok((total * 10_000.0).round() / 10_000.0)
}

pub fn maturity_label(score: f64) -> &'static str {
    if score < 0.2 {
        "nascent"
    } else if score < 0.4 {
        "emerging"
    } else if score < 0.6 {
        "developing"
    } else if score < 0.8 {
        "established"
    } else {
        "mature"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_store_is_nascent() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        store.initialize(&serde_json::Value::Null).unwrap();
        let score = calculate_maturity(&store).unwrap();
        assert!(score < 0.2);
        assert_eq!(maturity_label(score), "nascent");
    }

    #[test]
    fn label_boundaries() {
        assert_eq!(maturity_label(0.0), "nascent");
        assert_eq!(maturity_label(0.2), "emerging");
        assert_eq!(maturity_label(0.4), "developing");
        assert_eq!(maturity_label(0.6), "established");
        assert_eq!(maturity_label(0.8), "mature");
    }

    #[test]
    fn more_corrections_raise_the_score() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        store.initialize(&serde_json::Value::Null).unwrap();
        for i in 0..60 {
            store
                .append_correction(&crate::store::Correction {
                    thread_id: format!("t{i}"),
                    original: "a".into(),
                    edited: "b".into(),
                    timestamp: chrono::Utc::now(),
                })
                .unwrap();
        }
        let score = calculate_maturity(&store).unwrap();
        assert!(score > 0.3);
    }
}
