//! Error types for puregraph-compiler.
//!
//! A failed batch reports exactly one [`CompileError`]. Errors raised by
//! processors are enriched with the source location of the node being
//! processed when they do not already carry one.

use thiserror::Error;

use puregraph_core::{CoreError, SourceInformation};
use puregraph_source::SourceError;

use crate::matcher::Stage;

/// Errors produced while compiling a batch.
#[derive(Debug, Error)]
pub enum CompileError {
    /// User-facing error in the compiled sources: unresolved reference,
    /// duplicate definition, syntax error.
    #[error("compilation error{}: {message}", location_suffix(.location))]
    Compilation {
        message: String,
        location: Option<SourceInformation>,
    },

    /// Unexpected failure inside a processor.
    #[error("runtime error{}: {message}", location_suffix(.location))]
    Runtime {
        message: String,
        location: Option<SourceInformation>,
    },

    /// A handler was registered for a classifier path that does not resolve.
    #[error("unknown classifier '{path}'")]
    UnknownClassifier { path: String },

    /// Only the universal fallback handled a node where a real handler was
    /// required. This is a registration bug, not a user error.
    #[error("no {stage} handler matched NodeId({id}) (classifier {classifier})", id = node.0)]
    NoHandlerMatched {
        node: puregraph_core::NodeId,
        stage: Stage,
        classifier: String,
    },

    /// Compiler options could not be parsed.
    #[error("invalid compiler options: {0}")]
    InvalidOptions(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

impl CompileError {
    pub fn compilation(message: impl Into<String>, location: Option<SourceInformation>) -> Self {
        CompileError::Compilation {
            message: message.into(),
            location,
        }
    }

    pub fn runtime(message: impl Into<String>, location: Option<SourceInformation>) -> Self {
        CompileError::Runtime {
            message: message.into(),
            location,
        }
    }

    pub fn location(&self) -> Option<&SourceInformation> {
        match self {
            CompileError::Compilation { location, .. } | CompileError::Runtime { location, .. } => {
                location.as_ref()
            }
            _ => None,
        }
    }

    /// Attaches `location` to compilation and runtime errors that lack one.
    /// Graph errors raised inside a processor become runtime errors at
    /// `location`; every other variant is returned unchanged.
    pub fn with_location_if_missing(self, location: Option<SourceInformation>) -> Self {
        match self {
            CompileError::Compilation {
                message,
                location: None,
            } => CompileError::Compilation { message, location },
            CompileError::Runtime {
                message,
                location: None,
            } => CompileError::Runtime { message, location },
            CompileError::Core(err) if location.is_some() => CompileError::Runtime {
                message: err.to_string(),
                location,
            },
            other => other,
        }
    }

    pub fn is_compilation(&self) -> bool {
        matches!(self, CompileError::Compilation { .. })
    }
}

fn location_suffix(location: &Option<SourceInformation>) -> String {
    match location {
        Some(info) => format!(" at {info}"),
        None => String::new(),
    }
}
