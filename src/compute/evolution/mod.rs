//! Technique evolution: registry, weighted selection, and learning.
//!
//! # Overview
//!
//! - **Registry** (`registry`): catalog-ordered techniques with learned
//!   statistics, written through to a [`Persistence`](crate::store::Persistence)
//!   store.
//! - **Sampling** (`sampling`): seeded weighted sampling without
//!   replacement.
//! - **Selector** (`selector`): the select / await / update cycle.
//! - **History** (`history`): trends and system statistics.
//!
//! # Example
//!
//! ```rust,no_run
//! use prism::compute::evolution::{
//!     CycleOutcome, SelectionRng, TechniqueRegistry, TechniqueSelector,
//! };
//! use prism::schema::{FailureReason, PrismConfig, default_catalog};
//! use prism::store::MemoryStore;
//!
//! let config = PrismConfig::default();
//! let mut registry = TechniqueRegistry::load(
//!     default_catalog(),
//!     config.learning.clone(),
//!     Box::new(MemoryStore::new()),
//! );
//! let mut selector = TechniqueSelector::new(config.selection.clone(), SelectionRng::new(42));
//!
//! let selection = selector.select(&mut registry).unwrap();
//! println!("Cycle {}: {:?}", selection.cycle, selection.techniques);
//!
//! // Generation failed: the techniques still receive the failure floor.
//! let outcome = CycleOutcome::GenerationFailed(FailureReason::Timeout);
//! selector.record_outcome(&mut registry, &selection, &outcome).unwrap();
//! ```

mod history;
mod registry;
mod sampling;
mod selector;

pub use history::{
    HIGH_SCORE_THRESHOLD, SynergyPair, SystemStats, TechniqueSummary, technique_trend,
};
pub use registry::{RegistryError, TechniqueRegistry};
pub use sampling::{
    SelectionRng, weighted_index, weighted_sample_indices, weighted_sample_with,
    weighted_sample_without_replacement,
};
pub use selector::{CycleOutcome, SelectorError, SelectorState, TechniqueSelector};
