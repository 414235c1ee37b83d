//! Technique selection and the post-run statistics update.
//!
//! The selector cycles `Idle -> Selecting -> AwaitingOutcome -> Updating ->
//! Idle`. A new selection is refused until the previous one has been
//! resolved with [`TechniqueSelector::record_outcome`].

use chrono::Utc;
use log::debug;

use super::registry::{RegistryError, TechniqueRegistry};
use super::sampling::{SelectionRng, weighted_index, weighted_sample_with};
use crate::schema::{FailureReason, HistoryEntry, QualityScores, SelectionConfig, SelectionResult};

/// Lifecycle of one selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorState {
    Idle,
    Selecting,
    /// Generation, rendering and analysis happen outside the selector.
    AwaitingOutcome,
    Updating,
}

/// Selector misuse errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SelectorError {
    #[error("Selector is busy ({0:?}); resolve the current selection first")]
    Busy(SelectorState),
    #[error("Technique catalog is empty")]
    EmptyCatalog,
    #[error("Outcome does not match the active selection (cycle {expected:?}, got {got})")]
    SelectionMismatch { expected: Option<u64>, got: u64 },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What happened to a selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleOutcome {
    /// The artifact was analyzed.
    Scored(QualityScores),
    /// Generation or rendering failed before any artifact existed.
    GenerationFailed(FailureReason),
    /// An artifact exists but neither scoring path produced a score.
    Unscored,
}

impl CycleOutcome {
    /// Composite score driving the update; failures score `floor`.
    pub fn composite(&self, floor: f32) -> f32 {
        match self {
            CycleOutcome::Scored(scores) => scores.composite,
            CycleOutcome::GenerationFailed(_) | CycleOutcome::Unscored => floor,
        }
    }

    pub fn scores(&self) -> Option<QualityScores> {
        match self {
            CycleOutcome::Scored(scores) => Some(*scores),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            CycleOutcome::GenerationFailed(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Chooses technique sets and folds outcomes back into the registry.
pub struct TechniqueSelector {
    config: SelectionConfig,
    rng: SelectionRng,
    state: SelectorState,
    active: Option<SelectionResult>,
}

impl TechniqueSelector {
    pub fn new(config: SelectionConfig, rng: SelectionRng) -> Self {
        Self {
            config,
            rng,
            state: SelectorState::Idle,
            active: None,
        }
    }

    pub fn state(&self) -> SelectorState {
        self.state
    }

    /// The selection awaiting an outcome, if any.
    pub fn active(&self) -> Option<&SelectionResult> {
        self.active.as_ref()
    }

    /// Per-technique weight in catalog order:
    /// `performance_weight * avg / max_avg + success_weight * success_rate +
    /// innovation_weight * innovation / max_innovation`.
    pub fn base_weights(&self, registry: &TechniqueRegistry) -> Vec<f32> {
        let techniques = registry.all();
        let clock = registry.clock();

        let max_avg = techniques
            .iter()
            .map(|t| t.average_score)
            .fold(0.0f32, f32::max);

        let innovation: Vec<f32> = techniques
            .iter()
            .map(|t| {
                let since = t
                    .last_used_cycle
                    .map(|c| clock.saturating_sub(c))
                    .unwrap_or(clock) as f32;
                let effective_uses =
                    t.use_count as f32 / (1.0 + since * self.config.recency_decay.max(0.0));
                1.0 / (1.0 + effective_uses)
            })
            .collect();
        let max_innovation = innovation.iter().copied().fold(0.0f32, f32::max);

        techniques
            .iter()
            .zip(innovation.iter())
            .map(|(t, &inn)| {
                let performance = if max_avg > 0.0 {
                    t.average_score / max_avg
                } else {
                    0.0
                };
                let success = t.smoothed_success_rate(
                    self.config.prior_success_rate,
                    self.config.prior_strength,
                );
                let innovation = if max_innovation > 0.0 {
                    inn / max_innovation
                } else {
                    0.0
                };
                self.config.performance_weight * performance
                    + self.config.success_weight * success
                    + self.config.innovation_weight * innovation
            })
            .collect()
    }

    /// Fraction of the synergy horizon already observed, in [0, 1].
    pub fn synergy_confidence(&self, registry: &TechniqueRegistry) -> f32 {
        let horizon = self.config.synergy_confidence_horizon.max(1) as f32;
        (registry.synergy_pair_count() as f32 / horizon).min(1.0)
    }

    /// Probability curve over technique counts {1, ..., max_techniques},
    /// interpolated from the early curve toward the mature one.
    pub fn count_curve(&self, registry: &TechniqueRegistry) -> Vec<f32> {
        let c = self.synergy_confidence(registry);
        let max = self.config.max_techniques.clamp(1, 4);
        self.config
            .early_count_weights
            .iter()
            .zip(self.config.mature_count_weights.iter())
            .take(max)
            .map(|(&early, &mature)| early * (1.0 - c) + mature * c)
            .collect()
    }

    /// `weight * (1 + max_synergy_boost * mean synergy with selected)`.
    pub fn boosted_weight<S: AsRef<str>>(
        &self,
        registry: &TechniqueRegistry,
        candidate: &str,
        weight: f32,
        selected: &[S],
    ) -> f32 {
        synergy_boost(&self.config, registry, candidate, weight, selected)
    }

    /// Draw a technique set without touching selector state or the clock.
    pub fn preview(&mut self, registry: &TechniqueRegistry) -> Result<SelectionResult, SelectorError> {
        if registry.is_empty() {
            return Err(SelectorError::EmptyCatalog);
        }
        let techniques = registry.all();
        let ids: Vec<String> = techniques.iter().map(|t| t.id.clone()).collect();
        let base = self.base_weights(registry);

        let curve = self.count_curve(registry);
        let target = weighted_index(&curve, self.rng.rng())
            .map(|i| i + 1)
            .unwrap_or(1)
            .min(ids.len());

        let config = &self.config;
        let drawn = weighted_sample_with(ids.len(), target, self.rng.rng(), |i, picked| {
            let partners: Vec<&str> = picked.iter().map(|&j| ids[j].as_str()).collect();
            synergy_boost(config, registry, &ids[i], base[i], &partners)
        });
        let (selected, weights): (Vec<String>, Vec<f32>) = drawn
            .into_iter()
            .map(|(i, w)| (ids[i].clone(), w))
            .unzip();

        debug!(
            "Drew {} of target {} techniques: {:?}",
            selected.len(),
            target,
            selected
        );

        Ok(SelectionResult {
            cycle: registry.clock(),
            techniques: selected,
            weights,
        })
    }

    /// Start a cycle with a freshly drawn technique set.
    pub fn select(
        &mut self,
        registry: &mut TechniqueRegistry,
    ) -> Result<SelectionResult, SelectorError> {
        self.ensure_idle()?;
        if registry.is_empty() {
            return Err(SelectorError::EmptyCatalog);
        }
        self.state = SelectorState::Selecting;
        registry.tick();
        let result = self.preview(registry);
        self.activate(result)
    }

    /// Start a cycle with a given technique set (e.g. a variation reusing its
    /// parent's techniques).
    pub fn adopt(
        &mut self,
        registry: &mut TechniqueRegistry,
        techniques: &[String],
    ) -> Result<SelectionResult, SelectorError> {
        self.ensure_idle()?;
        let mut ids: Vec<String> = Vec::with_capacity(techniques.len());
        for id in techniques {
            registry.get(id)?;
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        if ids.is_empty() {
            return Err(SelectorError::EmptyCatalog);
        }

        self.state = SelectorState::Selecting;
        registry.tick();
        let base = self.base_weights(registry);
        let order: Vec<String> = registry.all().iter().map(|t| t.id.clone()).collect();
        let weights = ids
            .iter()
            .map(|id| {
                order
                    .iter()
                    .position(|o| o == id)
                    .map(|i| base[i])
                    .unwrap_or(0.0)
            })
            .collect();

        self.activate(Ok(SelectionResult {
            cycle: registry.clock(),
            techniques: ids,
            weights,
        }))
    }

    /// Fold an outcome into the registry and log a history entry.
    ///
    /// Every selected technique is updated with the composite (or the
    /// failure floor); each pair's synergy moves by
    /// `synergy_learning_rate * (composite - mean of the pair's prior
    /// averages)`.
    pub fn record_outcome(
        &mut self,
        registry: &mut TechniqueRegistry,
        selection: &SelectionResult,
        outcome: &CycleOutcome,
    ) -> Result<HistoryEntry, SelectorError> {
        if self.state != SelectorState::AwaitingOutcome {
            return Err(SelectorError::Busy(self.state));
        }
        if self.active.as_ref() != Some(selection) {
            return Err(SelectorError::SelectionMismatch {
                expected: self.active.as_ref().map(|a| a.cycle),
                got: selection.cycle,
            });
        }

        self.state = SelectorState::Updating;
        let result = self.apply_outcome(registry, selection, outcome);
        self.state = SelectorState::Idle;
        self.active = None;
        result
    }

    fn apply_outcome(
        &self,
        registry: &mut TechniqueRegistry,
        selection: &SelectionResult,
        outcome: &CycleOutcome,
    ) -> Result<HistoryEntry, SelectorError> {
        let learning = registry.learning().clone();
        let composite = outcome.composite(learning.failure_floor);
        let success = outcome.scores().is_some() && composite >= learning.success_threshold;

        let prior: Vec<f32> = selection
            .techniques
            .iter()
            .map(|id| registry.get(id).map(|t| t.average_score))
            .collect::<Result<_, _>>()?;

        for id in &selection.techniques {
            registry.update(id, composite, success)?;
        }

        let ids = &selection.techniques;
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let margin = composite - (prior[i] + prior[j]) / 2.0;
                registry.record_synergy(&ids[i], &ids[j], learning.synergy_learning_rate * margin)?;
            }
        }

        let entry = HistoryEntry {
            cycle: selection.cycle,
            timestamp: Utc::now(),
            techniques: selection.techniques.clone(),
            composite,
            scores: outcome.scores(),
            success,
            failure: outcome.failure(),
        };
        registry.append_history(entry.clone());
        Ok(entry)
    }

    fn ensure_idle(&self) -> Result<(), SelectorError> {
        if self.state != SelectorState::Idle {
            return Err(SelectorError::Busy(self.state));
        }
        Ok(())
    }

    fn activate(
        &mut self,
        result: Result<SelectionResult, SelectorError>,
    ) -> Result<SelectionResult, SelectorError> {
        match result {
            Ok(selection) => {
                self.state = SelectorState::AwaitingOutcome;
                self.active = Some(selection.clone());
                Ok(selection)
            }
            Err(e) => {
                self.state = SelectorState::Idle;
                Err(e)
            }
        }
    }
}

fn synergy_boost<S: AsRef<str>>(
    config: &SelectionConfig,
    registry: &TechniqueRegistry,
    candidate: &str,
    weight: f32,
    selected: &[S],
) -> f32 {
    if selected.is_empty() {
        return weight;
    }
    let mean = selected
        .iter()
        .map(|s| registry.synergy(candidate, s.as_ref()))
        .sum::<f32>()
        / selected.len() as f32;
    (weight * (1.0 + config.max_synergy_boost * mean)).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Category, LearningConfig};
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn registry(ids: &[&str]) -> TechniqueRegistry {
        let catalog = ids
            .iter()
            .map(|id| (id.to_string(), Category::Patterns))
            .collect();
        TechniqueRegistry::load(catalog, LearningConfig::default(), Box::new(MemoryStore::new()))
    }

    fn scored(composite: f32) -> CycleOutcome {
        CycleOutcome::Scored(QualityScores {
            complexity: composite,
            motion: composite,
            aesthetic: composite,
            composite,
            confidence: 1.0,
        })
    }

    fn selector(seed: u64) -> TechniqueSelector {
        TechniqueSelector::new(SelectionConfig::default(), SelectionRng::new(seed))
    }

    #[test]
    fn test_state_machine() {
        let mut reg = registry(&["a", "b", "c"]);
        let mut sel = selector(1);
        assert_eq!(sel.state(), SelectorState::Idle);

        let selection = sel.select(&mut reg).unwrap();
        assert_eq!(sel.state(), SelectorState::AwaitingOutcome);
        assert_eq!(sel.select(&mut reg), Err(SelectorError::Busy(SelectorState::AwaitingOutcome)));

        let mut stale = selection.clone();
        stale.cycle += 10;
        assert!(matches!(
            sel.record_outcome(&mut reg, &stale, &scored(0.5)),
            Err(SelectorError::SelectionMismatch { .. })
        ));

        sel.record_outcome(&mut reg, &selection, &scored(0.5)).unwrap();
        assert_eq!(sel.state(), SelectorState::Idle);
        assert!(sel.record_outcome(&mut reg, &selection, &scored(0.5)).is_err());
    }

    #[test]
    fn test_empty_catalog() {
        let mut reg = registry(&[]);
        let mut sel = selector(1);
        assert_eq!(sel.select(&mut reg), Err(SelectorError::EmptyCatalog));
        assert_eq!(sel.state(), SelectorState::Idle);
    }

    #[test]
    fn test_small_catalog_selects_all_available() {
        let mut reg = registry(&["only"]);
        let mut sel = selector(5);
        for _ in 0..20 {
            let s = sel.select(&mut reg).unwrap();
            assert_eq!(s.techniques, vec!["only".to_string()]);
            sel.record_outcome(&mut reg, &s, &scored(0.6)).unwrap();
        }
    }

    #[test]
    fn test_zero_weights_still_select() {
        let mut config = SelectionConfig::default();
        config.performance_weight = 0.0;
        config.success_weight = 0.0;
        config.innovation_weight = 0.0;
        let mut sel = TechniqueSelector::new(config, SelectionRng::new(11));
        let mut reg = registry(&["a", "b", "c", "d", "e"]);

        assert!(sel.base_weights(&reg).iter().all(|&w| w == 0.0));
        let s = sel.select(&mut reg).unwrap();
        assert!(!s.techniques.is_empty());
    }

    #[test]
    fn test_failure_records_floor() {
        let mut reg = registry(&["a", "b"]);
        let mut sel = selector(2);
        let s = sel.adopt(&mut reg, &["a".to_string(), "b".to_string()]).unwrap();
        let entry = sel
            .record_outcome(&mut reg, &s, &CycleOutcome::GenerationFailed(FailureReason::Timeout))
            .unwrap();
        assert!(!entry.success);
        assert_eq!(entry.failure, Some(FailureReason::Timeout));
        assert_eq!(entry.composite, LearningConfig::default().failure_floor);
        assert_eq!(reg.get("a").unwrap().use_count, 1);
        assert_eq!(reg.get("a").unwrap().success_count, 0);
        assert_eq!(reg.history().unwrap().len(), 1);
    }

    #[test]
    fn test_unused_techniques_gain_innovation() {
        let mut reg = registry(&["used", "fresh"]);
        let mut sel = selector(3);
        for _ in 0..5 {
            let s = sel.adopt(&mut reg, &["used".to_string()]).unwrap();
            sel.record_outcome(&mut reg, &s, &scored(0.5)).unwrap();
        }
        let weights = sel.base_weights(&reg);
        assert!(weights[1] > weights[0]);
    }

    #[test]
    fn test_count_curve_shifts_with_confidence() {
        let mut reg = registry(&["a", "b", "c", "d"]);
        let sel = selector(4);
        let early = sel.count_curve(&reg);
        assert_eq!(early, SelectionConfig::default().early_count_weights.to_vec());

        reg.record_synergy("a", "b", 0.1).unwrap();
        reg.record_synergy("c", "d", 0.1).unwrap();
        let shifted = sel.count_curve(&reg);
        assert!(shifted[0] < early[0]);
        assert!(shifted[3] > early[3]);
    }

    #[test]
    fn test_later_picks_carry_synergy_boost() {
        let mut reg = registry(&["a", "b", "c"]);
        reg.record_synergy("a", "b", 1.0).unwrap();
        let mut sel = selector(21);
        let base = sel.base_weights(&reg);

        let mut checked = 0;
        for _ in 0..500 {
            let s = sel.preview(&reg).unwrap();
            assert_eq!(s.techniques.len(), s.weights.len());
            if s.techniques.len() >= 2 && s.techniques[0] == "a" && s.techniques[1] == "b" {
                let boosted = sel.boosted_weight(&reg, "b", base[1], &["a"]);
                assert!(boosted > base[1]);
                assert!((s.weights[1] - boosted).abs() < 1e-6);
                checked += 1;
            }
        }
        assert!(checked > 0);
    }

    #[test]
    fn test_adopt_rejects_unknown() {
        let mut reg = registry(&["a"]);
        let mut sel = selector(1);
        assert!(matches!(
            sel.adopt(&mut reg, &["zzz".to_string()]),
            Err(SelectorError::Registry(_))
        ));
        assert_eq!(sel.state(), SelectorState::Idle);
    }

    proptest! {
        #[test]
        fn prop_selection_size_and_distinct(n in 1usize..12, seed in any::<u64>(), cycles in 1usize..6) {
            let names: Vec<String> = (0..n).map(|i| format!("t{}", i)).collect();
            let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
            let mut reg = registry(&refs);
            let mut sel = selector(seed);
            for c in 0..cycles {
                let s = sel.select(&mut reg).unwrap();
                prop_assert!(!s.techniques.is_empty());
                prop_assert!(s.techniques.len() <= n.min(4));
                prop_assert_eq!(s.techniques.len(), s.weights.len());
                let mut unique = s.techniques.clone();
                unique.sort();
                unique.dedup();
                prop_assert_eq!(unique.len(), s.techniques.len());
                prop_assert!(s.techniques.iter().all(|t| names.contains(t)));
                let score = (c as f32 * 0.37).fract();
                sel.record_outcome(&mut reg, &s, &scored(score)).unwrap();
            }
        }
    }
}
