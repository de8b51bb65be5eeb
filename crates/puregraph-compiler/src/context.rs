//! Per-batch state handed to every handler.

use indexmap::IndexSet;
use parking_lot::Mutex;

use puregraph_core::{NodeId, NodeRepository, SourceInformation};
use puregraph_source::SourceMutation;

use crate::error::CompileError;
use crate::matcher::{Matcher, Stage, VisitedSet};

/// Nodes a batch is tearing down, collected while unbinding.
#[derive(Debug, Default)]
pub struct BatchScope {
    /// Nodes being removed from the graph, in discovery order.
    removed: Mutex<IndexSet<NodeId>>,
    /// Surviving nodes whose bindings referenced removed nodes. They are
    /// unbound and then bound again in the same batch.
    dependents: Mutex<IndexSet<NodeId>>,
    /// Packages that lost a child while unbinding. Candidates for pruning
    /// once the batch has parsed and bound its new nodes.
    detached_from: Mutex<IndexSet<NodeId>>,
}

impl BatchScope {
    /// Adds `node` to the removal set. Returns `false` if it was already there.
    pub fn collect_removed(&self, node: NodeId) -> bool {
        self.removed.lock().insert(node)
    }

    pub fn is_removed(&self, node: NodeId) -> bool {
        self.removed.lock().contains(&node)
    }

    pub fn removed(&self) -> Vec<NodeId> {
        self.removed.lock().iter().copied().collect()
    }

    pub fn add_dependent(&self, node: NodeId) -> bool {
        self.dependents.lock().insert(node)
    }

    pub fn dependents(&self) -> Vec<NodeId> {
        self.dependents.lock().iter().copied().collect()
    }

    pub fn note_detached(&self, package: NodeId) {
        self.detached_from.lock().insert(package);
    }

    pub fn detached_from(&self) -> Vec<NodeId> {
        self.detached_from.lock().iter().copied().collect()
    }
}

/// Everything a handler may touch while processing one node.
#[derive(Clone, Copy)]
pub struct ProcessContext<'a> {
    repository: &'a NodeRepository,
    matcher: &'a Matcher,
    visited: &'a VisitedSet,
    mutation: &'a SourceMutation,
    scope: &'a BatchScope,
}

impl<'a> ProcessContext<'a> {
    pub fn new(
        repository: &'a NodeRepository,
        matcher: &'a Matcher,
        visited: &'a VisitedSet,
        mutation: &'a SourceMutation,
        scope: &'a BatchScope,
    ) -> Self {
        ProcessContext {
            repository,
            matcher,
            visited,
            mutation,
            scope,
        }
    }

    pub fn repository(&self) -> &'a NodeRepository {
        self.repository
    }

    pub fn matcher(&self) -> &'a Matcher {
        self.matcher
    }

    pub fn visited(&self) -> &'a VisitedSet {
        self.visited
    }

    pub fn mutation(&self) -> &'a SourceMutation {
        self.mutation
    }

    pub fn scope(&self) -> &'a BatchScope {
        self.scope
    }

    /// Dispatches another node through the same matcher and visited set.
    pub fn dispatch(&self, node: NodeId, stage: Stage) -> Result<bool, CompileError> {
        self.matcher.dispatch(self, node, stage)
    }

    pub fn full_dispatch(&self, node: NodeId, stage: Stage) -> Result<(), CompileError> {
        self.matcher.full_dispatch(self, node, stage)
    }

    pub fn location(&self, node: NodeId) -> Option<SourceInformation> {
        self.repository.source_information(node)
    }

    /// A compilation error located at `node`.
    pub fn error_at(&self, node: NodeId, message: impl Into<String>) -> CompileError {
        CompileError::compilation(message, self.location(node))
    }
}
