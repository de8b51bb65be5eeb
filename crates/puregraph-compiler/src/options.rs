//! Compiler configuration.

use serde::{Deserialize, Serialize};

use crate::error::CompileError;

/// Options controlling the incremental compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    /// Bind and validate batch roots on the rayon pool.
    pub parallel_dispatch: bool,

    /// Apply source mutations requested by processors and recompile.
    pub apply_source_mutations: bool,

    /// Upper bound on mutate-and-recompile rounds in one `compile` call.
    pub max_mutation_rounds: u32,

    /// Check the whole reachable graph for dangling references before commit.
    pub validate_repository: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            parallel_dispatch: false,
            apply_source_mutations: true,
            max_mutation_rounds: 4,
            validate_repository: true,
        }
    }
}

impl CompilerOptions {
    /// Parses options from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, CompileError> {
        Ok(serde_json::from_str(json)?)
    }
}
