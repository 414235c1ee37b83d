//! In-process store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Persistence, StorageError};
use crate::schema::{HistoryEntry, PatternRecord, Technique};

#[derive(Debug, Default)]
struct MemoryState {
    techniques: BTreeMap<String, Technique>,
    history: Vec<HistoryEntry>,
    patterns: Vec<PatternRecord>,
}

/// Store held entirely in memory.
///
/// Clones share the same state, so a handle kept outside the registry can
/// inspect what was written. Writes can be made to fail via
/// [`MemoryStore::failure_switch`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every write returns [`StorageError::Unavailable`].
    pub fn failure_switch(&self) -> Arc<AtomicBool> {
        self.fail_writes.clone()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn writable(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StorageError::Unavailable(
                "writes disabled by failure switch".to_string(),
            ));
        }
        self.lock()
    }
}

impl Persistence for MemoryStore {
    fn load_all_techniques(&self) -> Result<BTreeMap<String, Technique>, StorageError> {
        Ok(self.lock()?.techniques.clone())
    }

    fn save_technique(&mut self, technique: &Technique) -> Result<(), StorageError> {
        self.writable()?
            .techniques
            .insert(technique.id.clone(), technique.clone());
        Ok(())
    }

    fn append_history(&mut self, entry: &HistoryEntry) -> Result<(), StorageError> {
        self.writable()?.history.push(entry.clone());
        Ok(())
    }

    fn record_pattern(&mut self, record: &PatternRecord) -> Result<(), StorageError> {
        let mut state = self.writable()?;
        if state.patterns.iter().any(|p| p.version == record.version) {
            return Err(StorageError::DuplicateVersion(record.version));
        }
        if let Some(parent) = record.parent
            && !state.patterns.iter().any(|p| p.version == parent)
        {
            return Err(StorageError::UnknownParent {
                version: record.version,
                parent,
            });
        }
        state.patterns.push(record.clone());
        Ok(())
    }

    fn load_patterns(&self) -> Result<Vec<PatternRecord>, StorageError> {
        Ok(self.lock()?.patterns.clone())
    }

    fn load_history(&self) -> Result<Vec<HistoryEntry>, StorageError> {
        Ok(self.lock()?.history.clone())
    }
}
