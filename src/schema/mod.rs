//! Serializable configuration and data types.

mod config;
mod record;
mod technique;

pub use config::*;
pub use record::*;
pub use technique::*;
