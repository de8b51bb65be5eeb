//! Stable ID newtypes for repository entities.
//!
//! Node ids are handed out by the [`NodeRepository`](crate::repository::NodeRepository)
//! from a monotonically increasing counter, so a smaller id always means an
//! older node. Transaction ids follow the same scheme.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable node identifier, unique for the lifetime of a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Identifier of a [`Transaction`](crate::transaction::Transaction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

// Display implementations -- just print the inner value.

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
