//! The generation cycle loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{info, warn};

use super::{Artifact, GenerationError, GenerationRequest, ModelSelector, Orchestrator, PipelineError};
use crate::compute::evolution::{
    CycleOutcome, SelectionRng, SelectorError, SystemStats, TechniqueRegistry, TechniqueSelector,
};
use crate::compute::metrics::MetricsExtractor;
use crate::schema::{
    Category, HistoryEntry, PatternRecord, PrismConfig, SelectionResult, default_catalog,
};
use crate::store::{Persistence, StorageError, children, lineage};

/// Why a continuous run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    MaxCycles,
}

/// Everything one cycle produced.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub record: PatternRecord,
    pub entry: HistoryEntry,
    /// Set when generation failed; the techniques were scored at the floor.
    pub error: Option<GenerationError>,
    /// The full analysis failed and the reduced path (or the floor) was used.
    pub degraded: bool,
}

impl CycleReport {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Totals for a continuous run.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousSummary {
    pub cycles: usize,
    pub failures: usize,
    /// Best scored pattern as (version, composite).
    pub best: Option<(u64, f32)>,
    pub stop: StopReason,
}

const IDLE_SLICE: Duration = Duration::from_millis(250);

/// Drives select, generate, score, update, and record.
///
/// Cycles are strictly sequential. The cancel flag is only checked between
/// cycles and while idling, never during generation.
pub struct CycleRunner {
    config: PrismConfig,
    registry: TechniqueRegistry,
    selector: TechniqueSelector,
    extractor: MetricsExtractor,
    orchestrator: Box<dyn Orchestrator>,
    models: ModelSelector,
    rng: SelectionRng,
    next_version: u64,
    cancelled: Arc<AtomicBool>,
}

impl CycleRunner {
    /// Runner over the built-in technique catalog.
    pub fn new(
        config: PrismConfig,
        store: Box<dyn Persistence>,
        orchestrator: Box<dyn Orchestrator>,
    ) -> Self {
        Self::with_catalog(config, default_catalog(), store, orchestrator)
    }

    pub fn with_catalog(
        config: PrismConfig,
        catalog: Vec<(String, Category)>,
        store: Box<dyn Persistence>,
        orchestrator: Box<dyn Orchestrator>,
    ) -> Self {
        let mut rng = SelectionRng::from_seed(config.random_seed);
        let selector = TechniqueSelector::new(
            config.selection.clone(),
            SelectionRng::new(rng.next_seed()),
        );
        let registry = TechniqueRegistry::load(catalog, config.learning.clone(), store);
        let next_version = match registry.patterns() {
            Ok(patterns) => patterns.iter().map(|p| p.version).max().unwrap_or(0) + 1,
            Err(e) => {
                warn!("Could not read stored patterns, numbering from 1: {}", e);
                1
            }
        };
        info!(
            "Loaded {} techniques, next pattern v{}",
            registry.len(),
            next_version
        );

        Self {
            extractor: MetricsExtractor::new(config.metrics.clone()),
            models: ModelSelector::new(&config.models),
            config,
            registry,
            selector,
            orchestrator,
            rng,
            next_version,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag that stops a continuous run at the next check.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &PrismConfig {
        &self.config
    }

    pub fn registry(&self) -> &TechniqueRegistry {
        &self.registry
    }

    pub fn selector(&self) -> &TechniqueSelector {
        &self.selector
    }

    pub fn next_version(&self) -> u64 {
        self.next_version
    }

    /// Draw a technique set without starting a cycle.
    pub fn preview(&mut self) -> Result<SelectionResult, SelectorError> {
        self.selector.preview(&self.registry)
    }

    pub fn stats(&self, limit: usize) -> Result<SystemStats, StorageError> {
        let patterns = self.registry.patterns()?;
        let history = self.registry.history()?;
        Ok(SystemStats::collect(&patterns, &history, &self.registry, limit))
    }

    /// Ancestry of `version`, starting with the pattern itself.
    pub fn lineage(&self, version: u64) -> Result<Vec<PatternRecord>, PipelineError> {
        let chain = lineage(&self.registry.patterns()?, version);
        if chain.is_empty() {
            return Err(PipelineError::UnknownPattern(version));
        }
        Ok(chain)
    }

    /// Versions recorded as direct variations of `version`.
    pub fn variations(&self, version: u64) -> Result<Vec<u64>, StorageError> {
        Ok(children(&self.registry.patterns()?, version))
    }

    /// Run one cycle with a freshly selected technique set.
    ///
    /// Generation and analysis failures are folded into the report; only
    /// storage exhaustion and selector errors are returned.
    pub fn run_cycle(&mut self) -> Result<CycleReport, PipelineError> {
        self.check_storage()?;
        let selection = self.selector.select(&mut self.registry)?;
        self.complete(selection, None)
    }

    /// Generate a variation of a recorded pattern with the same techniques.
    pub fn run_variation(&mut self, parent: u64) -> Result<CycleReport, PipelineError> {
        self.check_storage()?;
        let patterns = self.registry.patterns()?;
        let record = patterns
            .iter()
            .find(|p| p.version == parent)
            .ok_or(PipelineError::UnknownPattern(parent))?;
        let selection = self
            .selector
            .adopt(&mut self.registry, &record.selection.techniques)?;
        self.complete(selection, Some(parent))
    }

    /// Run cycles until cancelled or `continuous.max_cycles` is reached,
    /// idling `continuous.interval_secs` between cycles.
    pub fn run_continuous<F>(&mut self, mut callback: F) -> Result<ContinuousSummary, PipelineError>
    where
        F: FnMut(&CycleReport),
    {
        let interval = Duration::from_secs(self.config.continuous.interval_secs);
        let max_cycles = self.config.continuous.max_cycles;
        let mut cycles = 0usize;
        let mut failures = 0usize;
        let mut best: Option<(u64, f32)> = None;

        let stop = loop {
            if self.is_cancelled() {
                break StopReason::Cancelled;
            }
            if max_cycles.is_some_and(|max| cycles >= max) {
                break StopReason::MaxCycles;
            }

            let report = self.run_cycle()?;
            cycles += 1;
            if report.failed() {
                failures += 1;
            } else if report.record.scores.is_some()
                && best.is_none_or(|(_, score)| report.record.composite > score)
            {
                best = Some((report.record.version, report.record.composite));
            }
            callback(&report);

            if max_cycles.is_some_and(|max| cycles >= max) {
                continue;
            }
            self.idle(interval);
        };

        info!(
            "Stopped after {} cycles ({} failed): {:?}",
            cycles, failures, stop
        );
        Ok(ContinuousSummary {
            cycles,
            failures,
            best,
            stop,
        })
    }

    fn idle(&self, interval: Duration) {
        let deadline = Instant::now() + interval;
        while !self.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(IDLE_SLICE.min(deadline - now));
        }
    }

    fn check_storage(&mut self) -> Result<(), PipelineError> {
        if self.registry.pending_writes() > 0 {
            self.registry.flush();
        }
        if self.registry.storage_exhausted() {
            return Err(PipelineError::StorageUnavailable(
                self.registry.consecutive_storage_failures(),
            ));
        }
        Ok(())
    }

    fn complete(
        &mut self,
        selection: SelectionResult,
        parent: Option<u64>,
    ) -> Result<CycleReport, PipelineError> {
        let version = self.next_version;
        self.next_version += 1;
        let model = self.models.pick(self.rng.rng());

        let techniques = selection
            .techniques
            .iter()
            .map(|id| self.registry.get(id).map(|t| (id.clone(), t.category)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(SelectorError::from)?;

        info!(
            "Cycle {} v{}: {:?} via {}",
            selection.cycle, version, selection.techniques, model
        );

        let request = GenerationRequest {
            version,
            cycle: selection.cycle,
            techniques,
            model: model.clone(),
            parent,
        };

        let (outcome, kind, location, error, degraded) = match self.orchestrator.generate(&request) {
            Ok(artifact) => {
                let (outcome, degraded) = self.score(&artifact, &selection);
                let location = artifact.location.as_ref().map(|p| p.display().to_string());
                (outcome, Some(artifact.kind), location, None, degraded)
            }
            Err(e) => {
                warn!(
                    "Cycle {} {:?}: generation failed: {}",
                    selection.cycle, selection.techniques, e
                );
                (CycleOutcome::GenerationFailed(e.reason), None, None, Some(e), false)
            }
        };

        let entry = self
            .selector
            .record_outcome(&mut self.registry, &selection, &outcome)?;

        let record = PatternRecord {
            version,
            timestamp: Utc::now(),
            selection,
            model,
            kind,
            scores: outcome.scores(),
            failure: outcome.failure(),
            composite: entry.composite,
            parent,
            location,
        };
        if let Err(e) = self.registry.record_pattern(record.clone()) {
            warn!("Pattern v{} was not recorded: {}", version, e);
        }

        info!(
            "Cycle {} v{}: composite {:.3}{}",
            entry.cycle,
            version,
            entry.composite,
            if entry.success { " (success)" } else { "" }
        );

        Ok(CycleReport {
            record,
            entry,
            error,
            degraded,
        })
    }

    /// Full analysis, then the reduced path, then the floor.
    fn score(&self, artifact: &Artifact, selection: &SelectionResult) -> (CycleOutcome, bool) {
        let frames = artifact.frames.as_ref();
        let error = match self.extractor.analyze(frames, artifact.is_animation()) {
            Ok(report) => return (CycleOutcome::Scored(report.scores), false),
            Err(e) => e,
        };
        warn!(
            "Cycle {} {:?}: analysis failed ({}); trying reduced analysis",
            selection.cycle, selection.techniques, error
        );

        match self.extractor.analyze_safe(frames) {
            Ok(report) => (CycleOutcome::Scored(report.scores), true),
            Err(e) => {
                warn!(
                    "Cycle {} {:?}: reduced analysis failed ({}); scoring at the floor",
                    selection.cycle, selection.techniques, e
                );
                (CycleOutcome::Unscored, true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::frames::{Frame, FrameError, FrameSource};
    use crate::pipeline::SyntheticOrchestrator;
    use crate::schema::FailureReason;
    use crate::store::MemoryStore;

    fn config() -> PrismConfig {
        let mut config = PrismConfig::default();
        config.random_seed = Some(11);
        config.continuous.interval_secs = 0;
        config
    }

    fn runner(orchestrator: SyntheticOrchestrator) -> (CycleRunner, MemoryStore) {
        let store = MemoryStore::new();
        let runner = CycleRunner::new(
            config(),
            Box::new(store.clone()),
            Box::new(orchestrator.with_size(16, 6)),
        );
        (runner, store)
    }

    /// Claims frames that never decode.
    struct Broken;

    impl FrameSource for Broken {
        fn frame_count(&self) -> usize {
            3
        }

        fn decode(&self, index: usize) -> Result<Frame, FrameError> {
            Err(FrameError::OutOfRange { index, count: 0 })
        }
    }

    struct BrokenOrchestrator;

    impl Orchestrator for BrokenOrchestrator {
        fn generate(&mut self, _request: &GenerationRequest) -> Result<Artifact, GenerationError> {
            Ok(Artifact::animation(Box::new(Broken), 30, 3, None))
        }
    }

    #[test]
    fn test_cycle_records_pattern() {
        let (mut runner, store) = runner(SyntheticOrchestrator::new(1));
        let report = runner.run_cycle().unwrap();

        assert!(!report.failed());
        assert_eq!(report.record.version, 1);
        assert!(report.record.scores.is_some());
        assert_eq!(runner.next_version(), 2);
        assert_eq!(store.load_patterns().unwrap().len(), 1);
        assert_eq!(store.load_history().unwrap().len(), 1);
        for id in &report.record.selection.techniques {
            assert_eq!(runner.registry().get(id).unwrap().use_count, 1);
        }
    }

    #[test]
    fn test_generation_failure_scores_floor() {
        let mut orch = SyntheticOrchestrator::new(1);
        orch.fail_next(FailureReason::Timeout);
        let (mut runner, _) = runner(orch);

        let report = runner.run_cycle().unwrap();
        assert!(report.failed());
        assert_eq!(report.record.failure, Some(FailureReason::Timeout));
        assert_eq!(report.record.composite, runner.config().learning.failure_floor);
        assert!(!report.entry.success);
    }

    #[test]
    fn test_undecodable_artifact_is_unscored() {
        let mut runner = CycleRunner::new(
            config(),
            Box::new(MemoryStore::new()),
            Box::new(BrokenOrchestrator),
        );
        let report = runner.run_cycle().unwrap();
        assert!(!report.failed());
        assert!(report.degraded);
        assert!(report.record.scores.is_none());
        assert_eq!(report.record.composite, runner.config().learning.failure_floor);
    }

    #[test]
    fn test_variation_links_parent() {
        let (mut runner, _) = runner(SyntheticOrchestrator::new(2));
        let first = runner.run_cycle().unwrap();
        let child = runner.run_variation(first.record.version).unwrap();

        assert_eq!(child.record.parent, Some(first.record.version));
        assert_eq!(child.record.selection.techniques, first.record.selection.techniques);

        let chain = runner.lineage(child.record.version).unwrap();
        let versions: Vec<u64> = chain.iter().map(|p| p.version).collect();
        assert_eq!(versions, vec![2, 1]);

        assert!(matches!(
            runner.run_variation(99),
            Err(PipelineError::UnknownPattern(99))
        ));
    }

    #[test]
    fn test_storage_exhaustion_stops_runner() {
        let (mut runner, store) = runner(SyntheticOrchestrator::new(3));
        store.failure_switch().store(true, Ordering::SeqCst);

        let mut result = Ok(());
        for _ in 0..50 {
            if let Err(e) = runner.run_cycle() {
                result = Err(e);
                break;
            }
        }
        assert!(matches!(result, Err(PipelineError::StorageUnavailable(_))));

        // Nothing is lost once the store recovers.
        store.failure_switch().store(false, Ordering::SeqCst);
        let report = runner.run_cycle().unwrap();
        let stored = store.load_patterns().unwrap();
        assert_eq!(stored.last().map(|p| p.version), Some(report.record.version));
        assert_eq!(stored.len() as u64, report.record.version);
    }

    #[test]
    fn test_continuous_stops_at_max_cycles() {
        let mut config = config();
        config.continuous.max_cycles = Some(3);
        let mut runner = CycleRunner::new(
            config,
            Box::new(MemoryStore::new()),
            Box::new(SyntheticOrchestrator::new(4).with_size(16, 4)),
        );

        let mut seen = Vec::new();
        let summary = runner
            .run_continuous(|report| seen.push(report.record.version))
            .unwrap();
        assert_eq!(summary.cycles, 3);
        assert_eq!(summary.stop, StopReason::MaxCycles);
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(summary.best.is_some());
    }

    #[test]
    fn test_cancelled_before_first_cycle() {
        let (mut runner, _) = runner(SyntheticOrchestrator::new(5));
        runner.cancel_handle().store(true, Ordering::SeqCst);
        let summary = runner.run_continuous(|_| {}).unwrap();
        assert_eq!(summary.cycles, 0);
        assert_eq!(summary.stop, StopReason::Cancelled);
    }

    #[test]
    fn test_resumes_version_numbering() {
        let store = MemoryStore::new();
        {
            let mut runner = CycleRunner::new(
                config(),
                Box::new(store.clone()),
                Box::new(SyntheticOrchestrator::new(6).with_size(16, 4)),
            );
            runner.run_cycle().unwrap();
            runner.run_cycle().unwrap();
        }
        let runner = CycleRunner::new(
            config(),
            Box::new(store),
            Box::new(SyntheticOrchestrator::new(6)),
        );
        assert_eq!(runner.next_version(), 3);
        assert!(runner.registry().clock() >= 2);
    }
}
