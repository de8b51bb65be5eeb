//! Classifier-driven handler dispatch.
//!
//! A [`Matcher`] maps `(classifier, Stage)` to the handlers registered for
//! it. Dispatching a node walks the linearized ancestors of the node's
//! classifier and fires every handler registered on each of them:
//!
//! - [`Stage::Bind`] and [`Stage::Validate`] run most-specific-first, so a
//!   subtype's handler sees the node before its supertypes' handlers do.
//! - [`Stage::UnbindWalk`] and [`Stage::Unbind`] run most-general-first, so
//!   generic cleanup happens before specific cleanup.
//!
//! Ancestor linearizations are computed with a topological sort over the
//! `generalizations` graph, with `Any` forced last, and cached until
//! [`Matcher::invalidate`] is called. A [`VisitedSet`] guarantees each
//! `(node, stage)` pair is dispatched at most once per batch.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::Serialize;

use puregraph_core::m3::{self, property};
use puregraph_core::{CoreError, NodeId, NodeRepository};

use crate::context::ProcessContext;
use crate::error::CompileError;

/// Processing stage a handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Bind,
    Validate,
    UnbindWalk,
    Unbind,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Bind, Stage::Validate, Stage::UnbindWalk, Stage::Unbind];

    /// Bind and validate resolve from the most specific classifier up.
    pub fn most_specific_first(self) -> bool {
        matches!(self, Stage::Bind | Stage::Validate)
    }

    fn index(self) -> usize {
        match self {
            Stage::Bind => 0,
            Stage::Validate => 1,
            Stage::UnbindWalk => 2,
            Stage::Unbind => 3,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Bind => "bind",
            Stage::Validate => "validate",
            Stage::UnbindWalk => "unbind-walk",
            Stage::Unbind => "unbind",
        };
        f.write_str(s)
    }
}

/// A processing handler.
pub type HandlerFn =
    Arc<dyn Fn(&ProcessContext<'_>, NodeId) -> Result<(), CompileError> + Send + Sync>;

/// `(stage, node)` pairs already dispatched in the current batch.
#[derive(Debug, Default)]
pub struct VisitedSet {
    visited: DashSet<(Stage, NodeId)>,
}

impl VisitedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically marks the pair visited. Returns `false` if it already was.
    pub fn insert(&self, stage: Stage, node: NodeId) -> bool {
        self.visited.insert((stage, node))
    }

    pub fn contains(&self, stage: Stage, node: NodeId) -> bool {
        self.visited.contains(&(stage, node))
    }

    pub fn len(&self) -> usize {
        self.visited.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visited.is_empty()
    }
}

/// What a single dispatch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The pair was already dispatched in this batch.
    AlreadyVisited,
    /// At least one registered handler fired.
    Handled,
    /// Only the stage's universal fallback fired.
    FallbackOnly,
    /// Nothing fired.
    Unhandled,
}

struct Registration {
    path: String,
    stage: Stage,
    handler: HandlerFn,
    strict: bool,
}

type HandlerTable = HashMap<(Stage, NodeId), Vec<HandlerFn>>;

/// Registry of classifier-scoped handlers. Built once at startup, then
/// shared read-only by every worker of a batch.
#[derive(Default)]
pub struct Matcher {
    registrations: Vec<Registration>,
    fallbacks: [Option<HandlerFn>; 4],
    table: RwLock<Option<Arc<HandlerTable>>>,
    ancestors: DashMap<NodeId, Arc<[NodeId]>>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Registers `handler` for instances of the classifier at `path`.
    /// Fails if the path does not name a classifier in `repo`.
    pub fn register<F>(
        &mut self,
        repo: &NodeRepository,
        path: &str,
        stage: Stage,
        handler: F,
    ) -> Result<(), CompileError>
    where
        F: Fn(&ProcessContext<'_>, NodeId) -> Result<(), CompileError> + Send + Sync + 'static,
    {
        if resolve_classifier(repo, path).is_none() {
            return Err(CompileError::UnknownClassifier {
                path: path.to_string(),
            });
        }
        self.push(path, stage, Arc::new(handler), true);
        Ok(())
    }

    /// Like [`register`](Self::register), but silently skips unknown
    /// classifiers. Returns whether the handler was registered.
    pub fn register_if_known<F>(
        &mut self,
        repo: &NodeRepository,
        path: &str,
        stage: Stage,
        handler: F,
    ) -> bool
    where
        F: Fn(&ProcessContext<'_>, NodeId) -> Result<(), CompileError> + Send + Sync + 'static,
    {
        if resolve_classifier(repo, path).is_none() {
            return false;
        }
        self.push(path, stage, Arc::new(handler), false);
        true
    }

    /// Sets the universal fallback for `stage`, fired when no registered
    /// handler matches a node.
    pub fn set_fallback<F>(&mut self, stage: Stage, handler: F)
    where
        F: Fn(&ProcessContext<'_>, NodeId) -> Result<(), CompileError> + Send + Sync + 'static,
    {
        self.fallbacks[stage.index()] = Some(Arc::new(handler));
    }

    fn push(&mut self, path: &str, stage: Stage, handler: HandlerFn, strict: bool) {
        self.registrations.push(Registration {
            path: path.to_string(),
            stage,
            handler,
            strict,
        });
        self.invalidate();
    }

    /// Drops cached classifier resolutions and linearizations. Call after
    /// any batch that may have changed the type graph.
    pub fn invalidate(&self) {
        *self.table.write() = None;
        self.ancestors.clear();
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Dispatches `node` for `stage`. Returns `true` if a registered handler
    /// (not just the fallback) fired during this call.
    pub fn dispatch(
        &self,
        ctx: &ProcessContext<'_>,
        node: NodeId,
        stage: Stage,
    ) -> Result<bool, CompileError> {
        Ok(self.dispatch_outcome(ctx, node, stage)? == DispatchOutcome::Handled)
    }

    /// Like [`dispatch`](Self::dispatch), but a node that only the fallback
    /// (or nothing) handled is an error.
    pub fn full_dispatch(
        &self,
        ctx: &ProcessContext<'_>,
        node: NodeId,
        stage: Stage,
    ) -> Result<(), CompileError> {
        match self.dispatch_outcome(ctx, node, stage)? {
            DispatchOutcome::Handled | DispatchOutcome::AlreadyVisited => Ok(()),
            DispatchOutcome::FallbackOnly | DispatchOutcome::Unhandled => {
                let repo = ctx.repository();
                let classifier = repo
                    .classifier(node)
                    .and_then(|c| repo.element_path(c))
                    .unwrap_or_else(|| "<none>".to_string());
                Err(CompileError::NoHandlerMatched {
                    node,
                    stage,
                    classifier,
                })
            }
        }
    }

    pub fn dispatch_outcome(
        &self,
        ctx: &ProcessContext<'_>,
        node: NodeId,
        stage: Stage,
    ) -> Result<DispatchOutcome, CompileError> {
        if !ctx.visited().insert(stage, node) {
            return Ok(DispatchOutcome::AlreadyVisited);
        }
        let repo = ctx.repository();
        let mut handled = false;

        if let Some(classifier) = repo.classifier(node) {
            let ancestors = self.ancestors(repo, classifier)?;
            let table = self.table(repo);
            let ordered: Vec<NodeId> = if stage.most_specific_first() {
                ancestors.iter().copied().collect()
            } else {
                ancestors.iter().rev().copied().collect()
            };
            for ancestor in ordered {
                let Some(handlers) = table.get(&(stage, ancestor)) else {
                    continue;
                };
                for handler in handlers {
                    handler(ctx, node)
                        .map_err(|e| e.with_location_if_missing(repo.source_information(node)))?;
                    handled = true;
                }
            }
        }

        if handled {
            return Ok(DispatchOutcome::Handled);
        }
        match &self.fallbacks[stage.index()] {
            Some(fallback) => {
                fallback(ctx, node)
                    .map_err(|e| e.with_location_if_missing(repo.source_information(node)))?;
                Ok(DispatchOutcome::FallbackOnly)
            }
            None => Ok(DispatchOutcome::Unhandled),
        }
    }

    // -----------------------------------------------------------------------
    // Resolution caches
    // -----------------------------------------------------------------------

    /// Linearized ancestors of `classifier`, most specific first, `Any` last.
    pub fn ancestors(
        &self,
        repo: &NodeRepository,
        classifier: NodeId,
    ) -> Result<Arc<[NodeId]>, CompileError> {
        if let Some(cached) = self.ancestors.get(&classifier) {
            return Ok(Arc::clone(cached.value()));
        }
        let linearized: Arc<[NodeId]> = linearize(repo, classifier)?.into();
        self.ancestors.insert(classifier, Arc::clone(&linearized));
        Ok(linearized)
    }

    fn table(&self, repo: &NodeRepository) -> Arc<HandlerTable> {
        if let Some(table) = self.table.read().as_ref() {
            return Arc::clone(table);
        }
        let mut slot = self.table.write();
        if let Some(table) = slot.as_ref() {
            return Arc::clone(table);
        }
        let mut table = HandlerTable::new();
        for reg in &self.registrations {
            match resolve_classifier(repo, &reg.path) {
                Some(id) => table
                    .entry((reg.stage, id))
                    .or_default()
                    .push(Arc::clone(&reg.handler)),
                None if reg.strict => {
                    tracing::warn!(path = %reg.path, stage = %reg.stage, "registered classifier no longer resolves");
                }
                None => {}
            }
        }
        let table = Arc::new(table);
        *slot = Some(Arc::clone(&table));
        table
    }
}

/// Resolves `path` to a node that is itself a classifier.
fn resolve_classifier(repo: &NodeRepository, path: &str) -> Option<NodeId> {
    let node = repo.resolve_path(path)?;
    let ty = repo.get_top_level(m3::TYPE)?;
    repo.instance_of(node, ty).then_some(node)
}

fn linearize(repo: &NodeRepository, classifier: NodeId) -> Result<Vec<NodeId>, CompileError> {
    let mut graph = DiGraphMap::<NodeId, ()>::new();
    graph.add_node(classifier);
    let mut seen = HashSet::from([classifier]);
    let mut stack = vec![classifier];
    while let Some(current) = stack.pop() {
        for sup in repo.to_many_nodes(current, property::GENERALIZATIONS) {
            graph.add_edge(current, sup, ());
            if seen.insert(sup) {
                stack.push(sup);
            }
        }
    }

    let mut order = toposort(&graph, None).map_err(|cycle| CoreError::GeneralizationCycle {
        classifier: cycle.node_id(),
    })?;
    if let Some(any) = repo.get_top_level(m3::ANY) {
        if let Some(pos) = order.iter().position(|n| *n == any) {
            let any = order.remove(pos);
            order.push(any);
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use puregraph_core::Value;
    use puregraph_source::SourceMutation;

    use super::*;
    use crate::context::BatchScope;

    /// `test::Parent` and `test::Child extends Parent`, plus an instance of Child.
    fn fixture() -> (NodeRepository, NodeId, NodeId, NodeId) {
        let repo = NodeRepository::bootstrapped().unwrap();
        let class = repo.get_top_level(m3::CLASS).unwrap();
        let any = repo.get_top_level(m3::ANY).unwrap();
        let pkg = repo.get_or_create_package("test").unwrap();

        let parent = repo.create_node("Parent", class, None, true).unwrap();
        repo.add_value(parent, property::GENERALIZATIONS, Value::Node(any))
            .unwrap();
        repo.add_child(pkg, parent).unwrap();
        repo.set_to_one(parent, property::PACKAGE, Value::Node(pkg))
            .unwrap();
        let child = repo.create_node("Child", class, None, true).unwrap();
        repo.add_value(child, property::GENERALIZATIONS, Value::Node(parent))
            .unwrap();
        repo.add_child(pkg, child).unwrap();
        repo.set_to_one(child, property::PACKAGE, Value::Node(pkg))
            .unwrap();

        let instance = repo.create_node("it", child, None, true).unwrap();
        (repo, parent, child, instance)
    }

    fn run<R>(repo: &NodeRepository, matcher: &Matcher, f: impl FnOnce(&ProcessContext<'_>) -> R) -> R {
        let visited = VisitedSet::new();
        let mutation = SourceMutation::new();
        let scope = BatchScope::default();
        let ctx = ProcessContext::new(repo, matcher, &visited, &mutation, &scope);
        f(&ctx)
    }

    #[test]
    fn linearization_puts_any_last() {
        let (repo, parent, child, _) = fixture();
        let matcher = Matcher::new();
        let any = repo.get_top_level(m3::ANY).unwrap();
        let order = matcher.ancestors(&repo, child).unwrap();
        assert_eq!(&*order, &[child, parent, any]);
    }

    #[test]
    fn register_rejects_unknown_classifier() {
        let (repo, ..) = fixture();
        let mut matcher = Matcher::new();
        let err = matcher
            .register(&repo, "test::Nope", Stage::Bind, |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, CompileError::UnknownClassifier { ref path } if path == "test::Nope"));
        assert!(!matcher.register_if_known(&repo, "test::Nope", Stage::Bind, |_, _| Ok(())));
        // A package is not a classifier.
        assert!(matcher
            .register(&repo, "test", Stage::Bind, |_, _| Ok(()))
            .is_err());
    }

    #[test]
    fn bind_runs_most_specific_first_unbind_reversed() {
        let (repo, _, _, instance) = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut matcher = Matcher::new();
        for stage in [Stage::Bind, Stage::UnbindWalk] {
            for path in ["test::Parent", "test::Child"] {
                let log = Arc::clone(&log);
                matcher
                    .register(&repo, path, stage, move |_, _| {
                        log.lock().push((stage, path));
                        Ok(())
                    })
                    .unwrap();
            }
        }

        run(&repo, &matcher, |ctx| {
            assert!(matcher.dispatch(ctx, instance, Stage::Bind).unwrap());
            assert!(matcher.dispatch(ctx, instance, Stage::UnbindWalk).unwrap());
        });
        assert_eq!(
            *log.lock(),
            vec![
                (Stage::Bind, "test::Child"),
                (Stage::Bind, "test::Parent"),
                (Stage::UnbindWalk, "test::Parent"),
                (Stage::UnbindWalk, "test::Child"),
            ]
        );
    }

    #[test]
    fn visited_pairs_are_skipped() {
        let (repo, _, _, instance) = fixture();
        let count = Arc::new(Mutex::new(0));
        let mut matcher = Matcher::new();
        let c = Arc::clone(&count);
        matcher
            .register(&repo, "test::Parent", Stage::Validate, move |_, _| {
                *c.lock() += 1;
                Ok(())
            })
            .unwrap();

        run(&repo, &matcher, |ctx| {
            assert!(matcher.dispatch(ctx, instance, Stage::Validate).unwrap());
            assert!(!matcher.dispatch(ctx, instance, Stage::Validate).unwrap());
            assert_eq!(
                matcher
                    .dispatch_outcome(ctx, instance, Stage::Validate)
                    .unwrap(),
                DispatchOutcome::AlreadyVisited
            );
        });
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn full_dispatch_rejects_fallback_only() {
        let (repo, _, _, instance) = fixture();
        let mut matcher = Matcher::new();
        matcher.set_fallback(Stage::UnbindWalk, |_, _| Ok(()));

        run(&repo, &matcher, |ctx| {
            assert!(!matcher.dispatch(ctx, instance, Stage::UnbindWalk).unwrap());
            let err = matcher
                .full_dispatch(ctx, instance, Stage::Unbind)
                .unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("no unbind handler matched NodeId({}) (classifier test::Child)", instance.0)
            );
        });
    }

    #[test]
    fn handler_errors_gain_node_location() {
        let repo = NodeRepository::bootstrapped().unwrap();
        let class = repo.get_top_level(m3::CLASS).unwrap();
        let info = puregraph_core::SourceInformation::new("/x.pure", 2, 1, 2, 10);
        let node = repo.create_node("X", class, Some(info.clone()), true).unwrap();
        let mut matcher = Matcher::new();
        matcher
            .register(&repo, m3::CLASS, Stage::Validate, |_, _| {
                Err(CompileError::compilation("bad", None))
            })
            .unwrap();

        let err = run(&repo, &matcher, |ctx| {
            matcher.dispatch(ctx, node, Stage::Validate).unwrap_err()
        });
        assert_eq!(err.location(), Some(&info));
    }

    #[test]
    fn invalidate_picks_up_new_generalizations() {
        let (repo, parent, child, _) = fixture();
        let matcher = Matcher::new();
        assert_eq!(matcher.ancestors(&repo, child).unwrap().len(), 3);

        let class = repo.get_top_level(m3::CLASS).unwrap();
        let extra = repo.create_node("Extra", class, None, true).unwrap();
        repo.add_value(parent, property::GENERALIZATIONS, Value::Node(extra))
            .unwrap();
        assert_eq!(matcher.ancestors(&repo, child).unwrap().len(), 3);
        matcher.invalidate();
        assert_eq!(matcher.ancestors(&repo, child).unwrap().len(), 4);
    }
}
