//! Persistence interface for technique statistics, history, and patterns.
//!
//! The store is a write-through cache target: in-memory state is
//! authoritative during a run, and every error here is recoverable from the
//! caller's point of view.

mod json;
mod memory;

use std::collections::BTreeMap;
use std::io;

use crate::schema::{HistoryEntry, PatternRecord, Technique};

pub use json::JsonStore;
pub use memory::MemoryStore;

/// Storage failures. Logged and retried by callers, never fatal per cycle.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Pattern {version} references unknown parent {parent}")]
    UnknownParent { version: u64, parent: u64 },
    #[error("Pattern version {0} already recorded")]
    DuplicateVersion(u64),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Whether retrying the same write later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io(_) | StorageError::Unavailable(_))
    }
}

/// Narrow durable-storage contract used by the registry and cycle runner.
pub trait Persistence: Send {
    /// All stored techniques keyed by id.
    fn load_all_techniques(&self) -> Result<BTreeMap<String, Technique>, StorageError>;

    /// Insert or replace one technique record.
    fn save_technique(&mut self, technique: &Technique) -> Result<(), StorageError>;

    fn append_history(&mut self, entry: &HistoryEntry) -> Result<(), StorageError>;

    /// Append a pattern. Fails if `version` exists or `parent` is unknown.
    fn record_pattern(&mut self, record: &PatternRecord) -> Result<(), StorageError>;

    /// All patterns in recording order.
    fn load_patterns(&self) -> Result<Vec<PatternRecord>, StorageError>;

    /// All history entries in append order.
    fn load_history(&self) -> Result<Vec<HistoryEntry>, StorageError>;
}

/// Ancestry of `version`, starting at the pattern itself and ending at its
/// root. Empty if `version` is unknown.
pub fn lineage(records: &[PatternRecord], version: u64) -> Vec<PatternRecord> {
    let by_version: BTreeMap<u64, &PatternRecord> =
        records.iter().map(|r| (r.version, r)).collect();

    let mut chain = Vec::new();
    let mut current = by_version.get(&version).copied();
    while let Some(record) = current {
        // Parents are only accepted once recorded, so chains are finite; the
        // length guard covers hand-edited files.
        if chain.len() > by_version.len() {
            break;
        }
        chain.push(record.clone());
        current = record.parent.and_then(|p| by_version.get(&p).copied());
    }
    chain
}

/// Direct children of `version`.
pub fn children(records: &[PatternRecord], version: u64) -> Vec<u64> {
    records
        .iter()
        .filter(|r| r.parent == Some(version))
        .map(|r| r.version)
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;

    use crate::schema::{PatternRecord, QualityScores, SelectionResult};

    pub fn pattern(version: u64, parent: Option<u64>) -> PatternRecord {
        PatternRecord {
            version,
            timestamp: Utc::now(),
            selection: SelectionResult {
                cycle: version,
                techniques: vec!["fractals".to_string(), "flow_fields".to_string()],
                weights: vec![0.7, 0.4],
            },
            model: "4o".to_string(),
            kind: Some(crate::schema::ArtifactKind::Animation),
            scores: Some(QualityScores {
                complexity: 0.6,
                motion: 0.7,
                aesthetic: 0.5,
                composite: 0.6,
                confidence: 1.0,
            }),
            failure: None,
            composite: 0.6,
            parent,
            location: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::pattern;
    use super::*;

    #[test]
    fn test_lineage_walks_to_root() {
        let records = vec![
            pattern(1, None),
            pattern(2, Some(1)),
            pattern(3, Some(2)),
            pattern(4, Some(1)),
        ];
        let chain: Vec<u64> = lineage(&records, 3).iter().map(|r| r.version).collect();
        assert_eq!(chain, vec![3, 2, 1]);
        assert!(lineage(&records, 99).is_empty());
        assert_eq!(children(&records, 1), vec![2, 4]);
    }

    #[test]
    fn test_lineage_stops_on_cycle() {
        let records = vec![pattern(1, Some(2)), pattern(2, Some(1))];
        assert!(lineage(&records, 1).len() <= 3);
    }
}
