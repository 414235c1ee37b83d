//! Full generation cycles with the synthetic orchestrator.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use prism::pipeline::{CycleRunner, PipelineError, StopReason, SyntheticOrchestrator};
use prism::schema::{Category, FailureReason, PrismConfig};
use prism::store::{JsonStore, MemoryStore, Persistence};
use tempfile::tempdir;

fn config(seed: u64) -> PrismConfig {
    let mut config = PrismConfig::default();
    config.random_seed = Some(seed);
    config.continuous.interval_secs = 0;
    config
}

fn synthetic(seed: u64) -> Box<SyntheticOrchestrator> {
    Box::new(SyntheticOrchestrator::new(seed).with_size(24, 8))
}

#[test]
fn cycles_update_statistics_and_history() {
    let store = MemoryStore::new();
    let mut runner = CycleRunner::new(config(1), Box::new(store.clone()), synthetic(1));

    for expected in 1..=5u64 {
        let report = runner.run_cycle().unwrap();
        assert_eq!(report.record.version, expected);
        let techniques = &report.record.selection.techniques;
        assert!(!techniques.is_empty() && techniques.len() <= 4);
        assert!((0.0..=1.0).contains(&report.record.composite));
    }

    let history = store.load_history().unwrap();
    assert_eq!(history.len(), 5);
    let uses: u64 = runner
        .registry()
        .all()
        .iter()
        .map(|t| t.use_count)
        .sum();
    let drawn: usize = history.iter().map(|h| h.techniques.len()).sum();
    assert_eq!(uses, drawn as u64);

    let stats = runner.stats(5).unwrap();
    assert_eq!(stats.total_patterns, 5);
    assert_eq!(stats.latest_version, Some(5));
    assert!(stats.mean_composite.is_some());
}

#[test]
fn failing_technique_loses_weight() {
    let mut orchestrator = SyntheticOrchestrator::new(2).with_size(16, 6);
    orchestrator.fail_technique("fractals", FailureReason::CompileError);

    let catalog = vec![
        ("fractals".to_string(), Category::Patterns),
        ("flow_fields".to_string(), Category::Motion),
        ("spirals".to_string(), Category::Geometry),
        ("tessellations".to_string(), Category::Patterns),
    ];
    let mut config = config(2);
    config.continuous.max_cycles = Some(40);
    let mut runner = CycleRunner::with_catalog(
        config,
        catalog,
        Box::new(MemoryStore::new()),
        Box::new(orchestrator),
    );

    let mut failures = 0;
    let summary = runner
        .run_continuous(|report| {
            if report.failed() {
                assert_eq!(report.record.failure, Some(FailureReason::CompileError));
                assert!(report.record.selection.techniques.iter().any(|t| t == "fractals"));
                failures += 1;
            }
        })
        .unwrap();
    assert_eq!(summary.cycles, 40);
    assert_eq!(summary.failures, failures);
    assert!(failures > 0);

    let fractals = runner.registry().get("fractals").unwrap();
    assert!(fractals.use_count > 0);
    assert_eq!(fractals.success_count, 0);
    assert!(fractals.average_score < 0.5);
}

#[test]
fn pattern_records_survive_reopen() {
    let dir = tempdir().unwrap();
    let mut config = config(3);
    config.data_dir = dir.path().to_path_buf();

    let (first, child) = {
        let store = JsonStore::open(&config.data_dir).unwrap();
        let mut runner = CycleRunner::new(config.clone(), Box::new(store), synthetic(3));
        let first = runner.run_cycle().unwrap();
        let child = runner.run_variation(first.record.version).unwrap();
        (first, child)
    };

    let store = JsonStore::open(&config.data_dir).unwrap();
    let patterns = store.load_patterns().unwrap();
    assert_eq!(patterns.len(), 2);
    assert_eq!(patterns[0].selection, first.record.selection);
    assert_eq!(patterns[0].composite, first.record.composite);
    assert_eq!(patterns[1].parent, Some(first.record.version));

    let runner = CycleRunner::new(config, Box::new(store), synthetic(3));
    assert_eq!(runner.next_version(), 3);
    let chain = runner.lineage(child.record.version).unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1].version, first.record.version);
    assert_eq!(
        runner.variations(first.record.version).unwrap(),
        vec![child.record.version]
    );
    assert!(runner.variations(child.record.version).unwrap().is_empty());

    for id in &first.record.selection.techniques {
        assert!(runner.registry().get(id).unwrap().use_count >= 1);
    }
}

#[test]
fn still_artifacts_are_scored() {
    let orchestrator = SyntheticOrchestrator::new(4).with_size(24, 8).stills();
    let mut runner = CycleRunner::new(config(4), Box::new(MemoryStore::new()), Box::new(orchestrator));
    let report = runner.run_cycle().unwrap();
    assert!(report.record.scores.is_some());
    assert_eq!(report.record.kind, Some(prism::schema::ArtifactKind::Still));
}

#[test]
fn cancellation_is_checked_while_idle() {
    let mut config = config(5);
    config.continuous.interval_secs = 60;
    let mut runner = CycleRunner::new(config, Box::new(MemoryStore::new()), synthetic(5));

    let cancel = runner.cancel_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        cancel.store(true, Ordering::SeqCst);
    });

    let start = Instant::now();
    let summary = runner.run_continuous(|_| {}).unwrap();
    stopper.join().unwrap();

    assert_eq!(summary.stop, StopReason::Cancelled);
    assert!(summary.cycles >= 1);
    assert!(start.elapsed() < Duration::from_secs(30));
}

#[test]
fn storage_outage_is_fatal_only_when_persistent() {
    let config = config(6);
    let rounds = config.learning.max_consecutive_storage_failures;
    let store = MemoryStore::new();
    let mut runner = CycleRunner::new(config, Box::new(store.clone()), synthetic(6));
    runner.run_cycle().unwrap();

    let switch = store.failure_switch();
    switch.store(true, Ordering::SeqCst);
    let report = runner.run_cycle().unwrap();
    assert!(!report.failed());
    assert!(runner.registry().pending_writes() > 0);
    assert!(!runner.registry().storage_exhausted());

    let mut survived = 1;
    let mut outcome = Ok(());
    for _ in 0..rounds * 2 {
        match runner.run_cycle() {
            Ok(_) => survived += 1,
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }
    assert!(matches!(outcome, Err(PipelineError::StorageUnavailable(n)) if n == rounds));
    assert_eq!(survived, rounds);

    switch.store(false, Ordering::SeqCst);
    runner.run_cycle().unwrap();
    assert_eq!(runner.registry().pending_writes(), 0);
    let versions: Vec<u64> = store
        .load_patterns()
        .unwrap()
        .iter()
        .map(|p| p.version)
        .collect();
    let expected: Vec<u64> = (1..runner.next_version()).collect();
    assert_eq!(versions, expected);
}

#[test]
fn brief_storage_outage_is_survived() {
    let store = MemoryStore::new();
    let mut runner = CycleRunner::new(config(7), Box::new(store.clone()), synthetic(7));
    let switch = store.failure_switch();

    switch.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        runner.run_cycle().unwrap();
    }
    switch.store(false, Ordering::SeqCst);
    runner.run_cycle().unwrap();

    assert_eq!(runner.registry().consecutive_storage_failures(), 0);
    assert_eq!(store.load_patterns().unwrap().len(), 4);
    assert_eq!(store.load_history().unwrap().len(), 4);
}
