//! Source text tracking for the puregraph compiler.
//!
//! - [`registry`] -- [`SourceRegistry`], source id -> text, version and compiled nodes
//! - [`changes`] -- [`ChangeSet`] detection by content hash
//! - [`mutation`] -- [`SourceMutation`], graph-driven edits to source text

pub mod changes;
pub mod error;
pub mod mutation;
pub mod registry;

pub use changes::{compute_change_set, ChangeSet};
pub use error::SourceError;
pub use mutation::{remove_lines, MutationReport, SourceMutation};
pub use registry::{SourceEntry, SourceRegistry, SourceVersion};
