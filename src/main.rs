//! PRISM CLI - Run generation cycles and inspect the technique store.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::warn;

use prism::{
    compute::{
        FrameDir, FrameSource, ImageFile, MetricsExtractor,
        evolution::{SystemStats, TechniqueRegistry},
    },
    pipeline::{
        CommandModel, CycleReport, CycleRunner, Orchestrator, ProcessingOrchestrator,
        SyntheticOrchestrator,
    },
    schema::{PrismConfig, default_catalog},
    store::{JsonStore, Persistence, children, lineage},
};

#[derive(Parser)]
#[command(name = "prism")]
#[command(about = "PRISM - Self-tuning generative art agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, global = true, env = "PRISM_CONFIG")]
    config: Option<PathBuf>,

    /// Random seed, overriding the configuration
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single generation cycle
    Run {
        /// Generate synthetic frames instead of calling a model and renderer
        #[arg(long)]
        dry_run: bool,
    },
    /// Run cycles until interrupted
    Continuous {
        /// Seconds between cycles
        #[arg(long)]
        interval: Option<u64>,
        /// Stop after this many cycles
        #[arg(long)]
        cycles: Option<usize>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Generate a variation of a recorded pattern
    Vary {
        version: u64,
        #[arg(long)]
        dry_run: bool,
    },
    /// Show system statistics
    Stats {
        /// Techniques and synergy pairs to list
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Show the ancestry of a pattern
    Lineage { version: u64 },
    /// Score a frame directory or a single image
    Analyze {
        path: PathBuf,
        /// Treat a directory as a single still (first frame only)
        #[arg(long)]
        still: bool,
    },
    /// Print the default configuration
    ExampleConfig,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Command::ExampleConfig = cli.command {
        print_example_config();
        return;
    }

    let mut config = load_config(cli.config.as_deref());
    if cli.seed.is_some() {
        config.random_seed = cli.seed;
    }

    match cli.command {
        Command::Run { dry_run } => {
            let mut runner = build_runner(config, dry_run);
            let report = runner.run_cycle().unwrap_or_else(|e| fail("Cycle failed", e));
            print_report(&report);
            if let Some(error) = &report.error {
                eprintln!("Generation failed ({}): {}", error.reason, error.message);
                process::exit(1);
            }
        }
        Command::Continuous {
            interval,
            cycles,
            dry_run,
        } => {
            if let Some(interval) = interval {
                config.continuous.interval_secs = interval;
            }
            if cycles.is_some() {
                config.continuous.max_cycles = cycles;
            }
            let interval = Duration::from_secs(config.continuous.interval_secs);
            let mut runner = build_runner(config, dry_run);

            let cancel = runner.cancel_handle();
            if let Err(e) = ctrlc::set_handler(move || {
                eprintln!("Stopping after the current cycle...");
                cancel.store(true, Ordering::SeqCst);
            }) {
                warn!("Could not install Ctrl-C handler: {}", e);
            }

            println!("PRISM continuous mode");
            println!("=====================");
            println!("Interval: {:?}", interval);
            println!();

            let summary = runner
                .run_continuous(print_report)
                .unwrap_or_else(|e| fail("Continuous run stopped", e));

            println!();
            println!(
                "Stopped ({:?}) after {} cycles, {} failed",
                summary.stop, summary.cycles, summary.failures
            );
            if let Some((version, score)) = summary.best {
                println!("Best: v{} ({:.3})", version, score);
            }
        }
        Command::Vary { version, dry_run } => {
            let mut runner = build_runner(config, dry_run);
            let report = runner
                .run_variation(version)
                .unwrap_or_else(|e| fail("Variation failed", e));
            print_report(&report);
            if let Some(error) = &report.error {
                eprintln!("Generation failed ({}): {}", error.reason, error.message);
                process::exit(1);
            }
        }
        Command::Stats { top } => {
            let store = open_store(&config);
            let patterns = store
                .load_patterns()
                .unwrap_or_else(|e| fail("Error reading patterns", e));
            let history = store
                .load_history()
                .unwrap_or_else(|e| fail("Error reading history", e));
            let registry =
                TechniqueRegistry::load(default_catalog(), config.learning.clone(), Box::new(store));
            print_stats(&SystemStats::collect(&patterns, &history, &registry, top));
        }
        Command::Lineage { version } => {
            let store = open_store(&config);
            let patterns = store
                .load_patterns()
                .unwrap_or_else(|e| fail("Error reading patterns", e));
            let chain = lineage(&patterns, version);
            if chain.is_empty() {
                eprintln!("Pattern v{} not found", version);
                process::exit(1);
            }
            for (depth, record) in chain.iter().enumerate() {
                println!(
                    "{}v{}  {:.3}  {}",
                    "  ".repeat(depth),
                    record.version,
                    record.composite,
                    record.selection.techniques.join(", ")
                );
            }
            let variations = children(&patterns, version);
            if !variations.is_empty() {
                let list: Vec<String> = variations.iter().map(|v| format!("v{}", v)).collect();
                println!("Variations: {}", list.join(", "));
            }
        }
        Command::Analyze { path, still } => analyze(&config, &path, still),
        Command::ExampleConfig => {}
    }
}

fn fail(context: &str, error: impl std::fmt::Display) -> ! {
    eprintln!("{}: {}", context, error);
    process::exit(1);
}

fn load_config(path: Option<&Path>) -> PrismConfig {
    let config = match path {
        Some(path) => {
            let config_str =
                fs::read_to_string(path).unwrap_or_else(|e| fail("Error reading config file", e));
            serde_json::from_str(&config_str).unwrap_or_else(|e| fail("Error parsing config", e))
        }
        None => PrismConfig::default(),
    };
    if let Err(e) = config.validate() {
        fail("Invalid configuration", e);
    }
    config
}

fn open_store(config: &PrismConfig) -> JsonStore {
    JsonStore::open(&config.data_dir).unwrap_or_else(|e| fail("Error opening store", e))
}

fn build_runner(config: PrismConfig, dry_run: bool) -> CycleRunner {
    let orchestrator: Box<dyn Orchestrator> = if dry_run {
        Box::new(SyntheticOrchestrator::new(config.random_seed.unwrap_or_else(rand::random)))
    } else {
        let Some(command) = config.models.command.as_deref() else {
            fail(
                "No model command configured",
                "set models.command or pass --dry-run",
            );
        };
        let timeout = Duration::from_secs(config.models.timeout_secs);
        let model = CommandModel::new(command, timeout)
            .unwrap_or_else(|| fail("Invalid model command", "command is empty"));
        Box::new(ProcessingOrchestrator::new(
            config.render.clone(),
            config.metrics.max_dimension,
            Box::new(model),
        ))
    };
    let store = open_store(&config);
    CycleRunner::new(config, Box::new(store), orchestrator)
}

fn print_report(report: &CycleReport) {
    let record = &report.record;
    let status = match (&report.error, report.degraded) {
        (Some(e), _) => format!("failed: {}", e.reason),
        (None, true) => "degraded".to_string(),
        (None, false) => "ok".to_string(),
    };
    println!(
        "Cycle {} v{} [{}] {} -> {:.3} ({})",
        report.entry.cycle,
        record.version,
        record.model,
        record.selection.techniques.join(", "),
        record.composite,
        status
    );
    if let Some(scores) = record.scores {
        println!(
            "  complexity={:.3} motion={:.3} aesthetic={:.3} confidence={:.2}",
            scores.complexity, scores.motion, scores.aesthetic, scores.confidence
        );
    }
    if let Some(location) = &record.location {
        println!("  output: {}", location);
    }
}

fn print_stats(stats: &SystemStats) {
    let fmt = |v: Option<f32>| v.map(|v| format!("{:.3}", v)).unwrap_or_else(|| "-".to_string());

    println!("PRISM statistics");
    println!("================");
    println!("Patterns: {}", stats.total_patterns);
    if let Some(latest) = stats.latest_version {
        println!("Latest version: v{}", latest);
    }
    println!("High scoring: {}", stats.high_scoring);
    println!("Failed: {}", stats.failed);
    println!("Mean composite: {}", fmt(stats.mean_composite));
    println!(
        "Mean complexity / motion / aesthetic: {} / {} / {}",
        fmt(stats.mean_complexity),
        fmt(stats.mean_motion),
        fmt(stats.mean_aesthetic)
    );

    if !stats.top_techniques.is_empty() {
        println!();
        println!("Top techniques:");
        for t in &stats.top_techniques {
            println!(
                "  {:<28} avg={:.3} uses={} success={:.0}% trend={}",
                t.id,
                t.average_score,
                t.use_count,
                t.success_rate * 100.0,
                t.trend
                    .map(|s| format!("{:+.4}", s))
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }

    if !stats.top_synergies.is_empty() {
        println!();
        println!("Top synergies:");
        for pair in &stats.top_synergies {
            println!("  {} + {}: {:+.3}", pair.a, pair.b, pair.synergy);
        }
    }
}

fn analyze(config: &PrismConfig, path: &Path, still: bool) {
    let max_dimension = config.metrics.max_dimension;
    let (source, animated): (Box<dyn FrameSource>, bool) = if path.is_dir() {
        let frames =
            FrameDir::open(path, max_dimension).unwrap_or_else(|e| fail("Error reading frames", e));
        (Box::new(frames), !still)
    } else {
        (Box::new(ImageFile::new(path, max_dimension)), false)
    };

    let extractor = MetricsExtractor::new(config.metrics.clone());
    let report = extractor
        .analyze(source.as_ref(), animated)
        .or_else(|e| {
            warn!("Full analysis failed ({}); using reduced analysis", e);
            extractor.analyze_safe(source.as_ref())
        })
        .unwrap_or_else(|e| fail("Analysis failed", e));

    let json = serde_json::to_string_pretty(&report).unwrap_or_else(|e| fail("Error serializing report", e));
    println!("{}", json);
}

fn print_example_config() {
    let config = PrismConfig::default();
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => fail("Error serializing config", e),
    }
}
