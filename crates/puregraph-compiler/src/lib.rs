//! The incremental compiler for puregraph.
//!
//! - [`incremental`] -- [`IncrementalCompiler`], batch orchestration and rollback
//! - [`matcher`] -- classifier-driven handler dispatch
//! - [`processors`] -- built-in handlers for the bootstrap metamodel
//! - [`parser`] -- the [`Parser`] plug-in point and [`DeclarationParser`]
//! - [`exclusion`] -- which nodes a batch unbinds
//! - [`context`] -- per-batch state handed to handlers
//! - [`options`] -- [`CompilerOptions`]

pub mod context;
pub mod error;
pub mod exclusion;
pub mod incremental;
pub mod matcher;
pub mod options;
pub mod parser;
pub mod processors;

pub use context::{BatchScope, ProcessContext};
pub use error::CompileError;
pub use exclusion::{compute_exclusion, ExclusionSet};
pub use incremental::{BatchPhase, BatchReport, CompileReport, IncrementalCompiler};
pub use matcher::{DispatchOutcome, HandlerFn, Matcher, Stage, VisitedSet};
pub use options::CompilerOptions;
pub use parser::{split_sections, DeclarationParser, ParseContext, Parser, Section};
