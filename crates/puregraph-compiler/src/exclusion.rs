//! Which nodes a batch has to tear down.
//!
//! The exclusion set of a batch over changed sources `S` has two parts:
//!
//! - **removed**: the top-level nodes the registry recorded for `S`, plus
//!   everything reachable from them through references that stays inside
//!   `S`. These nodes are unbound and evicted.
//! - **dependents**: top-level nodes of *other* sources whose bindings
//!   point into the removed part. They survive, but are unbound and bound
//!   again against the new definitions.
//!
//! Dependents are found by walking the reverse reference graph from the
//! removed nodes. The first step may cross into another source; further
//! steps stay inside that source, climbing from the referencing node (an
//! import stub, say) to the top-level element that owns it. Nodes without
//! source information (packages, the metamodel) stop the walk: they are
//! containers, not bindings.

use std::collections::{BTreeSet, VecDeque};

use indexmap::IndexSet;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;

use puregraph_core::m3::property;
use puregraph_core::{NodeId, NodeRepository};
use puregraph_source::SourceRegistry;

/// Nodes to unbind for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    /// Registry top-level nodes of the changed sources.
    pub roots: Vec<NodeId>,
    /// Every node owned by the changed sources, in discovery order.
    pub removed: IndexSet<NodeId>,
    /// Surviving top-level nodes bound against removed nodes.
    pub dependents: IndexSet<NodeId>,
}

impl ExclusionSet {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty() && self.removed.is_empty()
    }
}

/// Computes the exclusion set for `sources`.
pub fn compute_exclusion(
    repo: &NodeRepository,
    registry: &SourceRegistry,
    sources: &BTreeSet<String>,
) -> ExclusionSet {
    let roots: Vec<NodeId> = sources
        .iter()
        .flat_map(|s| registry.nodes(s).iter().copied())
        .filter(|n| repo.contains(*n))
        .collect();
    if roots.is_empty() {
        return ExclusionSet::default();
    }

    let in_scope = |node: NodeId| {
        repo.source_information(node)
            .is_some_and(|info| sources.contains(info.source_id()))
    };

    // Forward closure within the changed sources.
    let mut removed: IndexSet<NodeId> = IndexSet::new();
    let mut stack: Vec<NodeId> = roots.iter().rev().copied().collect();
    while let Some(node) = stack.pop() {
        if !removed.insert(node) {
            continue;
        }
        for target in references(repo, node) {
            if !removed.contains(&target) && in_scope(target) {
                stack.push(target);
            }
        }
    }

    let graph = reference_graph(repo);
    let mut dependents = IndexSet::new();
    let mut seen: IndexSet<NodeId> = IndexSet::new();
    let mut queue: VecDeque<(NodeId, Option<String>)> =
        removed.iter().map(|n| (*n, None)).collect();

    while let Some((node, owner)) = queue.pop_front() {
        if !graph.contains_node(node) {
            continue;
        }
        for referrer in graph.neighbors_directed(node, Direction::Incoming) {
            if removed.contains(&referrer) || seen.contains(&referrer) {
                continue;
            }
            let Some(info) = repo.source_information(referrer) else {
                continue;
            };
            let source = info.source_id();
            let allowed = match &owner {
                None => !sources.contains(source),
                Some(owner) => owner == source,
            };
            if !allowed {
                continue;
            }
            seen.insert(referrer);
            if registry.is_declared(referrer) {
                dependents.insert(referrer);
            }
            queue.push_back((referrer, Some(source.to_string())));
        }
    }

    tracing::debug!(
        roots = roots.len(),
        removed = removed.len(),
        dependents = dependents.len(),
        "exclusion set computed"
    );
    ExclusionSet {
        roots,
        removed,
        dependents,
    }
}

/// Outgoing binding references of `node`. `specializations` is left out:
/// it is the inverse of a subtype's `generalizations` and is cleaned up by
/// unbinding the subtype.
fn references(repo: &NodeRepository, node: NodeId) -> Vec<NodeId> {
    repo.with_node(node, |n| {
        n.node_references()
            .filter(|(p, _)| *p != property::SPECIALIZATIONS)
            .map(|(_, id)| id)
            .collect()
    })
    .unwrap_or_default()
}

/// Directed `referrer -> target` graph over every node reference in the
/// repository. Classifier links are left out: changing a classifier's
/// source does not invalidate the bindings of its instances.
fn reference_graph(repo: &NodeRepository) -> DiGraphMap<NodeId, ()> {
    let mut graph = DiGraphMap::new();
    for id in repo.node_ids() {
        graph.add_node(id);
        for target in references(repo, id) {
            graph.add_edge(id, target, ());
        }
    }
    graph
}
