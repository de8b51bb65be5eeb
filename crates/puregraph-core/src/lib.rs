//! Node graph, transactions and metamodel for the puregraph compiler.
//!
//! This crate owns the in-memory model graph that the incremental compiler
//! builds and rewrites:
//!
//! - [`repository`] -- [`NodeRepository`], the concurrent node arena and top-level table
//! - [`node`] -- [`GraphNode`], property values and compile-state flags
//! - [`transaction`] -- copy-on-write [`Transaction`] bookkeeping
//! - [`source_info`] -- [`SourceInformation`] spans
//! - [`m3`] -- the bootstrap metamodel
//! - [`locks`] -- key-scoped lock managers
//! - [`observer`] -- commit notifications

pub mod error;
pub mod id;
pub mod locks;
pub mod m3;
pub mod node;
pub mod observer;
pub mod repository;
pub mod source_info;
pub mod transaction;

pub use error::CoreError;
pub use id::{NodeId, TransactionId};
pub use locks::{KeyLockManager, KeyReadWriteLockManager, RepositoryLocks};
pub use node::{CompileState, GraphNode, Multiplicity, Property, Value};
pub use observer::{TracingTransactionObserver, TransactionObserver};
pub use repository::NodeRepository;
pub use source_info::SourceInformation;
pub use transaction::{CommitSummary, Transaction, TransactionState};
