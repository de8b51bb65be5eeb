//! Core error types for puregraph-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering
//! the failure modes of the node repository and its transactions.

use thiserror::Error;

use crate::id::{NodeId, TransactionId};
use crate::node::Multiplicity;
use crate::transaction::TransactionState;

/// Core errors produced by the puregraph-core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A node name is empty or contains the package separator.
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// A node id was not found in the repository.
    #[error("node not found: NodeId({id})", id = id.0)]
    NodeNotFound { id: NodeId },

    /// A different node is already registered under this top-level name.
    #[error("duplicate top-level name '{name}' (already bound to NodeId({existing}))", existing = existing.0)]
    DuplicateTopLevel { name: String, existing: NodeId },

    /// Ephemeral nodes never become top-level entries.
    #[error("ephemeral node NodeId({id}) cannot be registered as top-level '{name}'", id = id.0)]
    EphemeralTopLevel { name: String, id: NodeId },

    /// A property was written with the wrong multiplicity.
    #[error("property '{property}' on NodeId({id}) is {expected:?}", id = node.0)]
    MultiplicityMismatch {
        node: NodeId,
        property: String,
        expected: Multiplicity,
    },

    /// The marked-for-deletion flag can only be undone by a rollback.
    #[error("compile state of NodeId({id}) is sticky and cannot be cleared", id = node.0)]
    StickyState { node: NodeId },

    /// An operation is not valid for the transaction's current state.
    #[error("cannot {operation} transaction {id}: transaction is {state}")]
    TransactionState {
        id: TransactionId,
        state: TransactionState,
        operation: &'static str,
    },

    /// Transactions are never nested.
    #[error("transaction {id} is already open")]
    TransactionAlreadyOpen { id: TransactionId },

    /// `commit`/`rollback` with no transaction in flight.
    #[error("no open transaction")]
    NoOpenTransaction,

    /// The transaction was opened as non-committable.
    #[error("Transaction is not committable")]
    NotCommittable { id: TransactionId },

    /// A reachable node references a missing or deleted node.
    #[error("dangling reference: NodeId({from}).{property} -> NodeId({to})", from = from.0, to = to.0)]
    DanglingReference {
        from: NodeId,
        property: String,
        to: NodeId,
    },

    /// The generalization graph of a classifier is not acyclic.
    #[error("generalization cycle through NodeId({id})", id = classifier.0)]
    GeneralizationCycle { classifier: NodeId },
}
