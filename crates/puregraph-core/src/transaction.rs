//! Copy-on-write transactions over the node repository.
//!
//! A [`Transaction`] is the unit of atomicity for a compilation batch. It
//! records which nodes were created during the batch, the first-seen
//! snapshot of every pre-existing node touched during the batch, and an
//! overlay over the repository's top-level table. Commit and rollback are
//! driven by [`NodeRepository::commit`](crate::repository::NodeRepository::commit)
//! and [`NodeRepository::rollback`](crate::repository::NodeRepository::rollback).
//!
//! All bookkeeping is safe to call from concurrent workers: the collections
//! are `DashMap`/`DashSet`, and "first snapshot wins" is an atomic
//! entry-or-insert.

use std::fmt;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::CoreError;
use crate::id::{NodeId, TransactionId};
use crate::node::GraphNode;

/// Lifecycle of a transaction. Only `Open` accepts registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Open,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    /// The owning repository was cleared underneath the transaction.
    Invalid,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Open => "open",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::RollingBack => "rolling back",
            TransactionState::RolledBack => "rolled back",
            TransactionState::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    /// Persistent nodes created during the transaction that survived the commit.
    pub added: Vec<NodeId>,
    /// Pre-existing nodes that were modified and survived the commit.
    pub modified: Vec<NodeId>,
    /// Nodes evicted at commit (marked for deletion, or ephemeral).
    pub evicted: Vec<NodeId>,
}

/// Bookkeeping for one in-flight batch.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    committable: bool,
    state: Mutex<TransactionState>,
    new_nodes: DashSet<NodeId>,
    modified: DashMap<NodeId, GraphNode>,
    /// `None` marks a top-level entry removed within this transaction.
    top_level: DashMap<String, Option<NodeId>>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, committable: bool) -> Self {
        Transaction {
            id,
            committable,
            state: Mutex::new(TransactionState::Open),
            new_nodes: DashSet::new(),
            modified: DashMap::new(),
            top_level: DashMap::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransactionState::Open
    }

    pub fn is_committable(&self) -> bool {
        self.committable
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Records a node created during this transaction. Idempotent; returns
    /// `true` the first time.
    pub fn register_new(&self, node: NodeId) -> Result<bool, CoreError> {
        self.ensure_open("register a node in")?;
        Ok(self.new_nodes.insert(node))
    }

    /// Records the pre-modification snapshot of `node`. Only the first
    /// snapshot for a node is kept; later calls are no-ops returning `false`.
    /// Nodes created in this transaction are never snapshotted.
    pub fn register_modified(&self, node: NodeId, snapshot: GraphNode) -> Result<bool, CoreError> {
        self.register_modified_with(node, || snapshot)
    }

    pub(crate) fn register_modified_with(
        &self,
        node: NodeId,
        snapshot: impl FnOnce() -> GraphNode,
    ) -> Result<bool, CoreError> {
        self.ensure_open("register a modification in")?;
        if self.new_nodes.contains(&node) {
            return Ok(false);
        }
        let mut inserted = false;
        self.modified.entry(node).or_insert_with(|| {
            inserted = true;
            snapshot()
        });
        Ok(inserted)
    }

    /// True if the node is new in, or already snapshotted by, this transaction.
    pub fn is_registered(&self, node: NodeId) -> bool {
        self.new_nodes.contains(&node) || self.modified.contains_key(&node)
    }

    pub fn is_new(&self, node: NodeId) -> bool {
        self.new_nodes.contains(&node)
    }

    pub fn is_modified(&self, node: NodeId) -> bool {
        self.modified.contains_key(&node)
    }

    /// The snapshot taken the first time `node` was modified.
    pub fn snapshot(&self, node: NodeId) -> Option<GraphNode> {
        self.modified.get(&node).map(|s| s.value().clone())
    }

    /// New nodes, in allocation order.
    pub fn new_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.new_nodes.iter().map(|id| *id).collect();
        ids.sort();
        ids
    }

    /// Modified pre-existing nodes, in allocation order.
    pub fn modified_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.modified.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // -----------------------------------------------------------------------
    // Top-level overlay
    // -----------------------------------------------------------------------

    /// Looks `name` up in the overlay only. `Some(None)` means the name was
    /// removed in this transaction.
    pub fn overlay_top_level(&self, name: &str) -> Option<Option<NodeId>> {
        self.top_level.get(name).map(|e| *e.value())
    }

    /// Returns the node bound to `name`, binding `node` in the overlay if the
    /// name is free. `committed` is the binding in the repository's base table.
    pub fn get_or_add_top_level(
        &self,
        name: &str,
        node: NodeId,
        committed: Option<NodeId>,
    ) -> Result<NodeId, CoreError> {
        self.ensure_open("add a top-level to")?;
        let mut entry = self
            .top_level
            .entry(name.to_string())
            .or_insert(committed);
        match *entry.value() {
            Some(existing) => Ok(existing),
            None => {
                *entry.value_mut() = Some(node);
                Ok(node)
            }
        }
    }

    pub(crate) fn remove_top_level(&self, name: &str) -> Result<(), CoreError> {
        self.ensure_open("remove a top-level from")?;
        self.top_level.insert(name.to_string(), None);
        Ok(())
    }

    pub(crate) fn overlay_entries(&self) -> Vec<(String, Option<NodeId>)> {
        self.top_level
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Lifecycle (driven by the repository)
    // -----------------------------------------------------------------------

    /// Moves `Open -> next`, failing for any other starting state.
    pub(crate) fn begin_terminal(
        &self,
        next: TransactionState,
        operation: &'static str,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        if *state != TransactionState::Open {
            return Err(CoreError::TransactionState {
                id: self.id,
                state: *state,
                operation,
            });
        }
        *state = next;
        Ok(())
    }

    pub(crate) fn set_state(&self, next: TransactionState) {
        *self.state.lock() = next;
    }

    pub(crate) fn take_modified(&self) -> Vec<(NodeId, GraphNode)> {
        let ids = self.modified_nodes();
        ids.into_iter()
            .filter_map(|id| self.modified.remove(&id))
            .collect()
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), CoreError> {
        let state = self.state();
        if state != TransactionState::Open {
            return Err(CoreError::TransactionState {
                id: self.id,
                state,
                operation,
            });
        }
        Ok(())
    }
}
