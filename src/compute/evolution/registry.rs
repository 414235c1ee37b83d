//! Technique registry: catalog, learned statistics, and write-through
//! persistence.

use std::collections::{BTreeMap, VecDeque};

use log::{debug, warn};

use crate::schema::{Category, HistoryEntry, LearningConfig, PatternRecord, Technique};
use crate::store::{Persistence, StorageError};

/// Registry lookup errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown technique: {0}")]
    UnknownTechnique(String),
}

/// A write that has not reached the store yet.
#[derive(Debug, Clone)]
enum PendingWrite {
    /// Latest in-memory state of the named technique.
    Technique(String),
    History(HistoryEntry),
    Pattern(PatternRecord),
}

/// Holds every technique in catalog order and owns the store handle.
///
/// In-memory statistics are authoritative. Writes go through to the store;
/// transient failures are queued in order and retried before the next write.
pub struct TechniqueRegistry {
    order: Vec<String>,
    techniques: BTreeMap<String, Technique>,
    learning: LearningConfig,
    store: Box<dyn Persistence>,
    pending: VecDeque<PendingWrite>,
    consecutive_failures: usize,
    clock: u64,
}

impl TechniqueRegistry {
    /// Build the registry from a catalog, restoring stored statistics.
    ///
    /// Stored techniques that are not in the catalog are ignored. A store
    /// that cannot be read yields fresh statistics.
    pub fn load(
        catalog: Vec<(String, Category)>,
        learning: LearningConfig,
        store: Box<dyn Persistence>,
    ) -> Self {
        let mut stored = match store.load_all_techniques() {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Could not load technique statistics, starting fresh: {}", e);
                BTreeMap::new()
            }
        };

        let mut order = Vec::with_capacity(catalog.len());
        let mut techniques = BTreeMap::new();
        for (id, category) in catalog {
            if techniques.contains_key(&id) {
                warn!("Duplicate catalog entry {} ignored", id);
                continue;
            }
            let technique = match stored.remove(&id) {
                Some(mut t) => {
                    t.category = category;
                    t
                }
                None => Technique::new(id.clone(), category, &learning),
            };
            order.push(id.clone());
            techniques.insert(id, technique);
        }

        let clock = techniques
            .values()
            .filter_map(|t| t.last_used_cycle)
            .max()
            .unwrap_or(0);

        Self {
            order,
            techniques,
            learning,
            store,
            pending: VecDeque::new(),
            consecutive_failures: 0,
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn learning(&self) -> &LearningConfig {
        &self.learning
    }

    pub fn get(&self, id: &str) -> Result<&Technique, RegistryError> {
        self.techniques
            .get(id)
            .ok_or_else(|| RegistryError::UnknownTechnique(id.to_string()))
    }

    /// All techniques in catalog declaration order.
    pub fn all(&self) -> Vec<&Technique> {
        self.order
            .iter()
            .filter_map(|id| self.techniques.get(id))
            .collect()
    }

    /// Current selector clock.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Advance the selector clock by one cycle and return the new value.
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Fold one score into a technique's statistics.
    ///
    /// The average moves toward `score` by the adaptation rate; the rate
    /// then grows when recent scores are stable and shrinks when volatile.
    pub fn update(&mut self, id: &str, score: f32, success: bool) -> Result<(), RegistryError> {
        let learning = &self.learning;
        let clock = self.clock;
        let technique = self
            .techniques
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownTechnique(id.to_string()))?;

        let score = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            learning.failure_floor
        };

        let old = technique.average_score;
        technique.average_score = old + technique.adaptation_rate * (score - old);
        technique.use_count += 1;
        if success {
            technique.success_count += 1;
        }
        technique.last_used_cycle = Some(clock);

        technique.recent_scores.push_back(score);
        while technique.recent_scores.len() > learning.volatility_window.max(1) {
            technique.recent_scores.pop_front();
        }

        if let Some(std) = technique.recent_std() {
            if std < learning.stable_std {
                technique.adaptation_rate *= 1.0 + learning.adaptation_step;
            } else if std > learning.volatile_std {
                technique.adaptation_rate *= 1.0 - learning.adaptation_step;
            }
        }
        technique.adaptation_rate = technique
            .adaptation_rate
            .clamp(learning.min_adaptation_rate, learning.max_adaptation_rate);

        debug!(
            "Updated {}: avg {:.3} -> {:.3}, rate {:.3}, success {}/{}",
            id,
            old,
            technique.average_score,
            technique.adaptation_rate,
            technique.success_count,
            technique.use_count
        );

        self.persist(PendingWrite::Technique(id.to_string()));
        Ok(())
    }

    /// Symmetric synergy between two techniques; zero when never recorded.
    pub fn synergy(&self, a: &str, b: &str) -> f32 {
        self.techniques
            .get(a)
            .map(|t| t.synergy_with(b))
            .unwrap_or(0.0)
    }

    /// Adjust the synergy of a pair by `delta`, clamped to the configured
    /// bounds. A zero delta leaves the pair untouched.
    pub fn record_synergy(&mut self, a: &str, b: &str, delta: f32) -> Result<(), RegistryError> {
        for id in [a, b] {
            if !self.techniques.contains_key(id) {
                return Err(RegistryError::UnknownTechnique(id.to_string()));
            }
        }
        if a == b || delta == 0.0 || !delta.is_finite() {
            return Ok(());
        }

        let (lo, hi) = self.learning.synergy_bounds;
        let value = (self.synergy(a, b) + delta).clamp(lo, hi);
        for (x, y) in [(a, b), (b, a)] {
            if let Some(t) = self.techniques.get_mut(x) {
                t.synergy.insert(y.to_string(), value);
            }
        }
        debug!("Synergy {} <-> {} now {:.3}", a, b, value);

        self.persist(PendingWrite::Technique(a.to_string()));
        self.persist(PendingWrite::Technique(b.to_string()));
        Ok(())
    }

    /// Number of distinct pairs with a recorded synergy value.
    pub fn synergy_pair_count(&self) -> usize {
        self.techniques
            .values()
            .map(|t| t.synergy.keys().filter(|other| **other > t.id).count())
            .sum()
    }

    /// Recorded pairs sorted by descending synergy.
    pub fn top_synergy_pairs(&self, limit: usize) -> Vec<(String, String, f32)> {
        let mut pairs: Vec<(String, String, f32)> = self
            .techniques
            .values()
            .flat_map(|t| {
                t.synergy
                    .iter()
                    .filter(|(other, _)| **other > t.id)
                    .map(|(other, &v)| (t.id.clone(), other.clone(), v))
            })
            .collect();
        pairs.sort_by(|x, y| y.2.total_cmp(&x.2));
        pairs.truncate(limit);
        pairs
    }

    pub fn append_history(&mut self, entry: HistoryEntry) {
        self.persist(PendingWrite::History(entry));
    }

    /// Queue a pattern for the store.
    ///
    /// Lineage violations are returned; transient failures are retried.
    pub fn record_pattern(&mut self, record: PatternRecord) -> Result<(), StorageError> {
        if !self.pending.is_empty() {
            self.persist(PendingWrite::Pattern(record));
            return Ok(());
        }
        match self.store.record_pattern(&record) {
            Ok(()) => {
                self.consecutive_failures = 0;
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!("Queueing pattern v{} after storage failure: {}", record.version, e);
                self.consecutive_failures += 1;
                self.pending.push_back(PendingWrite::Pattern(record));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stored patterns, including ones still waiting to be written.
    pub fn patterns(&self) -> Result<Vec<PatternRecord>, StorageError> {
        let mut patterns = self.store.load_patterns()?;
        patterns.extend(self.pending.iter().filter_map(|w| match w {
            PendingWrite::Pattern(r) => Some(r.clone()),
            _ => None,
        }));
        Ok(patterns)
    }

    /// Stored history, including entries still waiting to be written.
    pub fn history(&self) -> Result<Vec<HistoryEntry>, StorageError> {
        let mut history = self.store.load_history()?;
        history.extend(self.pending.iter().filter_map(|w| match w {
            PendingWrite::History(h) => Some(h.clone()),
            _ => None,
        }));
        Ok(history)
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    pub fn consecutive_storage_failures(&self) -> usize {
        self.consecutive_failures
    }

    /// True once `max_consecutive_storage_failures` flush rounds in a row
    /// have left writes pending.
    pub fn storage_exhausted(&self) -> bool {
        self.consecutive_failures >= self.learning.max_consecutive_storage_failures.max(1)
    }

    /// One retry round over the queued writes. A round that leaves writes
    /// pending counts as a single storage failure. Returns the number still
    /// pending.
    pub fn flush(&mut self) -> usize {
        if !self.drain() {
            self.consecutive_failures += 1;
            warn!(
                "Storage unavailable ({} pending, {} failed rounds)",
                self.pending.len(),
                self.consecutive_failures
            );
        }
        self.pending.len()
    }

    /// Write queued entries in order until one fails. False if a transient
    /// failure left writes pending.
    fn drain(&mut self) -> bool {
        while let Some(write) = self.pending.front().cloned() {
            match self.write(&write) {
                Ok(()) => {
                    self.consecutive_failures = 0;
                    self.pending.pop_front();
                }
                Err(e) if e.is_transient() => {
                    debug!("Storage write deferred ({} pending): {}", self.pending.len(), e);
                    return false;
                }
                Err(e) => {
                    warn!("Dropping write rejected by store: {}", e);
                    self.pending.pop_front();
                }
            }
        }
        true
    }

    fn persist(&mut self, write: PendingWrite) {
        if let PendingWrite::Technique(id) = &write
            && self
                .pending
                .iter()
                .any(|w| matches!(w, PendingWrite::Technique(p) if p == id))
        {
            // Already queued; the drain writes the latest state.
            self.drain();
            return;
        }
        self.pending.push_back(write);
        self.drain();
    }

    fn write(&mut self, write: &PendingWrite) -> Result<(), StorageError> {
        match write {
            PendingWrite::Technique(id) => match self.techniques.get(id) {
                Some(t) => self.store.save_technique(t),
                None => Ok(()),
            },
            PendingWrite::History(entry) => self.store.append_history(entry),
            PendingWrite::Pattern(record) => self.store.record_pattern(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use proptest::prelude::*;
    use std::sync::atomic::Ordering;

    fn catalog(ids: &[&str]) -> Vec<(String, Category)> {
        ids.iter()
            .map(|id| (id.to_string(), Category::Geometry))
            .collect()
    }

    fn registry(ids: &[&str]) -> (TechniqueRegistry, MemoryStore) {
        let store = MemoryStore::new();
        let registry = TechniqueRegistry::load(
            catalog(ids),
            LearningConfig::default(),
            Box::new(store.clone()),
        );
        (registry, store)
    }

    #[test]
    fn test_all_preserves_catalog_order() {
        let (registry, _) = registry(&["c", "a", "b"]);
        let ids: Vec<&str> = registry.all().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert!(registry.get("zzz").is_err());
    }

    #[test]
    fn test_update_moves_toward_score() {
        let (mut registry, _) = registry(&["a"]);
        let before = registry.get("a").unwrap().average_score;
        registry.update("a", 0.9, true).unwrap();
        let after = registry.get("a").unwrap().average_score;
        assert!(after > before && after < 0.9);

        registry.update("a", 0.1, false).unwrap();
        let t = registry.get("a").unwrap();
        assert!(t.average_score < after);
        assert_eq!(t.use_count, 2);
        assert_eq!(t.success_count, 1);
    }

    #[test]
    fn test_convergence_bounded_by_min_rate() {
        let (mut registry, _) = registry(&["a"]);
        let learning = registry.learning().clone();
        let target = 0.95;
        let initial_gap = (target - registry.get("a").unwrap().average_score).abs();
        let mut prev_gap = initial_gap;

        for n in 1..=12 {
            registry.update("a", target, true).unwrap();
            let gap = (target - registry.get("a").unwrap().average_score).abs();
            assert!(gap < prev_gap);
            let bound = initial_gap * (1.0 - learning.min_adaptation_rate).powi(n);
            assert!(gap <= bound + 1e-6);
            prev_gap = gap;
        }
        assert!(prev_gap < 0.01);
    }

    #[test]
    fn test_adaptation_rate_reacts_to_volatility() {
        let (mut registry, _) = registry(&["stable", "volatile"]);
        for _ in 0..5 {
            registry.update("stable", 0.7, true).unwrap();
        }
        for i in 0..5 {
            let score = if i % 2 == 0 { 0.0 } else { 1.0 };
            registry.update("volatile", score, i % 2 == 1).unwrap();
        }
        let initial = LearningConfig::default().initial_adaptation_rate;
        assert!(registry.get("stable").unwrap().adaptation_rate > initial);
        assert!(registry.get("volatile").unwrap().adaptation_rate < initial);
        assert_eq!(registry.get("stable").unwrap().recent_scores.len(), 5);
    }

    #[test]
    fn test_synergy_symmetric_and_zero_delta_noop() {
        let (mut registry, _) = registry(&["a", "b"]);
        registry.record_synergy("a", "b", 0.2).unwrap();
        assert_eq!(registry.synergy("a", "b"), registry.synergy("b", "a"));
        let value = registry.synergy("a", "b");
        for _ in 0..10 {
            registry.record_synergy("a", "b", 0.0).unwrap();
        }
        assert_eq!(registry.synergy("a", "b"), value);
        assert_eq!(registry.synergy_pair_count(), 1);
        assert!(registry.record_synergy("a", "nope", 0.1).is_err());
    }

    #[test]
    fn test_statistics_restored_from_store() {
        let (mut registry, store) = registry(&["a", "b"]);
        registry.tick();
        registry.tick();
        registry.update("a", 0.8, true).unwrap();
        registry.record_synergy("a", "b", 0.4).unwrap();

        let restored =
            TechniqueRegistry::load(catalog(&["a", "b"]), LearningConfig::default(), Box::new(store));
        assert_eq!(restored.get("a").unwrap(), registry.get("a").unwrap());
        assert!((restored.synergy("b", "a") - 0.4).abs() < 1e-6);
        assert_eq!(restored.clock(), 2);
    }

    #[test]
    fn test_failed_writes_are_retried_in_order() {
        let (mut registry, store) = registry(&["a"]);
        let switch = store.failure_switch();
        switch.store(true, Ordering::Relaxed);

        registry.update("a", 0.9, true).unwrap();
        registry.update("a", 0.8, true).unwrap();
        assert_eq!(registry.get("a").unwrap().use_count, 2);
        assert_eq!(registry.pending_writes(), 1);
        assert_eq!(registry.consecutive_storage_failures(), 0);
        assert!(store.load_all_techniques().unwrap().is_empty());
        assert_eq!(registry.flush(), 1);
        assert_eq!(registry.consecutive_storage_failures(), 1);

        switch.store(false, Ordering::Relaxed);
        assert_eq!(registry.flush(), 0);
        assert_eq!(registry.consecutive_storage_failures(), 0);
        let saved = store.load_all_techniques().unwrap();
        assert_eq!(saved.get("a").unwrap().use_count, 2);
    }

    #[test]
    fn test_storage_exhaustion_counts_flush_rounds() {
        let store = MemoryStore::new();
        let mut learning = LearningConfig::default();
        learning.max_consecutive_storage_failures = 3;
        let mut registry =
            TechniqueRegistry::load(catalog(&["a", "b", "c", "d"]), learning, Box::new(store.clone()));
        store.failure_switch().store(true, Ordering::Relaxed);

        // A full cycle's worth of writes against a dead store.
        for id in ["a", "b", "c", "d"] {
            registry.update(id, 0.5, false).unwrap();
        }
        for (x, y) in [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")] {
            registry.record_synergy(x, y, 0.1).unwrap();
        }
        assert!(registry.pending_writes() > 3);
        assert_eq!(registry.consecutive_storage_failures(), 0);
        assert!(!registry.storage_exhausted());

        registry.flush();
        registry.flush();
        assert!(!registry.storage_exhausted());
        registry.flush();
        assert!(registry.storage_exhausted());

        store.failure_switch().store(false, Ordering::Relaxed);
        assert_eq!(registry.flush(), 0);
        assert!(!registry.storage_exhausted());
    }

    proptest! {
        #[test]
        fn prop_synergy_stays_in_bounds(deltas in prop::collection::vec(-2.0f32..2.0, 0..50)) {
            let (mut registry, _) = registry(&["a", "b"]);
            let (lo, hi) = registry.learning().synergy_bounds;
            for d in deltas {
                registry.record_synergy("a", "b", d).unwrap();
                let s = registry.synergy("a", "b");
                prop_assert!(s >= lo && s <= hi);
                prop_assert_eq!(s, registry.synergy("b", "a"));
            }
        }

        #[test]
        fn prop_update_never_overshoots(score in 0.0f32..=1.0, repeats in 1usize..20) {
            let (mut registry, _) = registry(&["a"]);
            for _ in 0..repeats {
                let before = registry.get("a").unwrap().average_score;
                registry.update("a", score, score > 0.5).unwrap();
                let after = registry.get("a").unwrap().average_score;
                prop_assert!((after - score).abs() <= (before - score).abs() + 1e-6);
                let t = registry.get("a").unwrap();
                prop_assert!(t.success_count <= t.use_count);
            }
        }
    }
}
