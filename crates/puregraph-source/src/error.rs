//! Error types for puregraph-source.

use thiserror::Error;

use puregraph_core::CoreError;

/// Errors produced by the source registry and source mutations.
#[derive(Debug, Error)]
pub enum SourceError {
    /// No live source is registered under this id.
    #[error("unknown source '{source_id}'")]
    UnknownSource { source_id: String },

    /// A line range does not fit the source it targets.
    #[error("invalid line range {start}-{end} for source '{source_id}'")]
    InvalidLineRange {
        source_id: String,
        start: u32,
        end: u32,
    },

    /// A graph operation failed while recording a mutation.
    #[error(transparent)]
    Core(#[from] CoreError),
}
