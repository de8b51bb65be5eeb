//! Commit notifications.

use crate::id::NodeId;

/// Notified once per successful commit. Never called on rollback.
pub trait TransactionObserver: Send + Sync {
    /// Persistent nodes created by the committed transaction.
    fn added(&self, nodes: &[NodeId]);

    /// Pre-existing nodes modified by the committed transaction.
    fn modified(&self, nodes: &[NodeId]);
}

/// Default observer: emits a `tracing` event per notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTransactionObserver;

impl TransactionObserver for TracingTransactionObserver {
    fn added(&self, nodes: &[NodeId]) {
        if !nodes.is_empty() {
            tracing::debug!(count = nodes.len(), "nodes added");
        }
    }

    fn modified(&self, nodes: &[NodeId]) {
        if !nodes.is_empty() {
            tracing::debug!(count = nodes.len(), "nodes modified");
        }
    }
}
