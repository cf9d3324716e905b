use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

/// One entry of an item's local change history.
///
/// History lists are append-only. Two lists are merged by concatenation,
/// never compared value by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

impl HistoryRecord {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            recorded_at: chrono::Utc::now(),
        }
    }
}

/// Concatenates `incoming` after `existing`, skipping records already present.
pub fn merge_history(existing: &[HistoryRecord], incoming: &[HistoryRecord]) -> Vec<HistoryRecord> {
    let mut seen: HashSet<Uuid> = existing.iter().map(|r| r.id).collect();
    let mut merged = existing.to_vec();
    for record in incoming {
        if seen.insert(record.id) {
            merged.push(record.clone());
        }
    }
    merged
}
