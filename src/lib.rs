//! PRISM - Self-tuning generative art agent.
//!
//! Each cycle draws a set of creative techniques, has an orchestrator turn
//! them into an animation or still image, scores the result with image
//! heuristics, and folds the score back into the per-technique statistics
//! that drive the next draw.
//!
//! # Architecture
//!
//! - `schema`: Configuration, technique, and record types
//! - `compute`: Frame decoding, the metrics extractor, and the technique
//!   registry / selector
//! - `store`: Persistence of statistics, history, and pattern lineage
//! - `pipeline`: The orchestrator boundary, renderers, and the cycle runner
//!
//! # Example
//!
//! ```rust,no_run
//! use prism::{
//!     pipeline::{CycleRunner, SyntheticOrchestrator},
//!     schema::PrismConfig,
//!     store::MemoryStore,
//! };
//!
//! let mut runner = CycleRunner::new(
//!     PrismConfig::default(),
//!     Box::new(MemoryStore::new()),
//!     Box::new(SyntheticOrchestrator::new(7)),
//! );
//!
//! let report = runner.run_cycle().unwrap();
//! println!(
//!     "v{}: {:?} scored {:.3}",
//!     report.record.version, report.record.selection.techniques, report.record.composite
//! );
//! ```

pub mod compute;
pub mod pipeline;
pub mod schema;
pub mod store;

// Re-export commonly used types
pub use compute::MetricsExtractor;
pub use compute::evolution::{TechniqueRegistry, TechniqueSelector};
pub use pipeline::{CycleRunner, Orchestrator};
pub use schema::PrismConfig;
