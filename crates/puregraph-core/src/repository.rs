//! The node repository: arena of [`GraphNode`]s plus the top-level table.
//!
//! [`NodeRepository`] is the single entry point for graph mutation. Every
//! mutating method consults the currently open [`Transaction`] (if any) and
//! records the touched node's first-seen snapshot before changing it, so a
//! batch can always be rolled back to the exact pre-batch graph.
//!
//! Nodes live in a `DashMap` keyed by [`NodeId`], which lets handlers running
//! on parallel workers mutate disjoint nodes without a global lock. Callers
//! must never hold a node reference across another repository call; all
//! read accessors either copy data out or run a closure under the shard lock.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::CoreError;
use crate::id::{NodeId, TransactionId};
use crate::locks::RepositoryLocks;
use crate::m3;
use crate::node::{CompileState, GraphNode, Value, CHILDREN};
use crate::observer::{TracingTransactionObserver, TransactionObserver};
use crate::source_info::SourceInformation;
use crate::transaction::{CommitSummary, Transaction, TransactionState};

/// Package path separator.
pub const PATH_SEPARATOR: &str = "::";

/// Prefix of generated names for anonymous nodes.
pub const ANONYMOUS_PREFIX: &str = "@_";

/// Concurrent arena of graph nodes with transactional mutation.
pub struct NodeRepository {
    nodes: DashMap<NodeId, GraphNode>,
    top_level: DashMap<String, NodeId>,
    next_node_id: AtomicU32,
    next_transaction_id: AtomicU64,
    current: RwLock<Option<Arc<Transaction>>>,
    observer: RwLock<Arc<dyn TransactionObserver>>,
    locks: RepositoryLocks,
}

impl NodeRepository {
    /// Creates an empty repository with no metamodel.
    pub fn new() -> Self {
        NodeRepository {
            nodes: DashMap::new(),
            top_level: DashMap::new(),
            next_node_id: AtomicU32::new(0),
            next_transaction_id: AtomicU64::new(1),
            current: RwLock::new(None),
            observer: RwLock::new(Arc::new(TracingTransactionObserver)),
            locks: RepositoryLocks::default(),
        }
    }

    /// Creates a repository with the core metamodel (see [`m3`]) installed.
    pub fn bootstrapped() -> Result<Self, CoreError> {
        let repo = Self::new();
        m3::bootstrap(&repo)?;
        Ok(repo)
    }

    pub fn set_observer(&self, observer: Arc<dyn TransactionObserver>) {
        *self.observer.write() = observer;
    }

    pub fn locks(&self) -> &RepositoryLocks {
        &self.locks
    }

    /// Drops every node and top-level entry. An in-flight transaction is
    /// invalidated; its later commit or rollback fails.
    pub fn clear(&self) {
        if let Some(txn) = self.current.write().take() {
            tracing::warn!(transaction = %txn.id(), "repository cleared under open transaction");
            txn.set_state(TransactionState::Invalid);
        }
        self.nodes.clear();
        self.top_level.clear();
    }

    // -----------------------------------------------------------------------
    // Node creation
    // -----------------------------------------------------------------------

    /// Creates a named node. Names must be non-empty and must not contain
    /// the package separator.
    pub fn create_node(
        &self,
        name: &str,
        classifier: NodeId,
        source: Option<SourceInformation>,
        persistent: bool,
    ) -> Result<NodeId, CoreError> {
        validate_name(name)?;
        if !self.contains(classifier) {
            return Err(CoreError::NodeNotFound { id: classifier });
        }
        self.allocate(name.to_string(), Some(classifier), source, persistent)
    }

    /// Creates a node with a generated `@_<id>` name.
    pub fn create_anonymous(
        &self,
        classifier: NodeId,
        source: Option<SourceInformation>,
        persistent: bool,
    ) -> Result<NodeId, CoreError> {
        if !self.contains(classifier) {
            return Err(CoreError::NodeNotFound { id: classifier });
        }
        let id = self.next_id();
        let name = format!("{ANONYMOUS_PREFIX}{}", id.0);
        self.insert(GraphNode::new(id, name, Some(classifier), source, persistent))
    }

    /// Creates a node without a classifier. Only the metamodel bootstrap
    /// needs this, to tie the `Class` knot.
    pub(crate) fn allocate(
        &self,
        name: String,
        classifier: Option<NodeId>,
        source: Option<SourceInformation>,
        persistent: bool,
    ) -> Result<NodeId, CoreError> {
        let id = self.next_id();
        self.insert(GraphNode::new(id, name, classifier, source, persistent))
    }

    fn next_id(&self) -> NodeId {
        NodeId(self.next_node_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, node: GraphNode) -> Result<NodeId, CoreError> {
        let id = node.id();
        if let Some(txn) = self.open_transaction() {
            txn.register_new(id)?;
        }
        self.nodes.insert(id, node);
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Read access
    // -----------------------------------------------------------------------

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Runs `f` against the node under its shard lock.
    pub fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&GraphNode) -> R) -> Option<R> {
        self.nodes.get(&id).map(|n| f(n.value()))
    }

    /// A copy of the node's current state.
    pub fn node(&self, id: NodeId) -> Option<GraphNode> {
        self.with_node(id, GraphNode::clone)
    }

    pub fn name(&self, id: NodeId) -> Option<String> {
        self.with_node(id, |n| n.name().to_string())
    }

    pub fn classifier(&self, id: NodeId) -> Option<NodeId> {
        self.with_node(id, |n| n.classifier()).flatten()
    }

    pub fn source_information(&self, id: NodeId) -> Option<SourceInformation> {
        self.with_node(id, |n| n.source_information().cloned())
            .flatten()
    }

    pub fn compile_states(&self, id: NodeId) -> CompileState {
        self.with_node(id, |n| n.compile_states())
            .unwrap_or_default()
    }

    pub fn has_state(&self, id: NodeId, state: CompileState) -> bool {
        self.compile_states(id).contains(state)
    }

    /// All values of a property, empty if the node or property is missing.
    pub fn values(&self, id: NodeId, property: &str) -> Vec<Value> {
        self.with_node(id, |n| n.to_many(property).to_vec())
            .unwrap_or_default()
    }

    pub fn to_one_node(&self, id: NodeId, property: &str) -> Option<NodeId> {
        self.with_node(id, |n| n.to_one(property).and_then(Value::as_node))
            .flatten()
    }

    pub fn to_one_string(&self, id: NodeId, property: &str) -> Option<String> {
        self.with_node(id, |n| {
            n.to_one(property)
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .flatten()
    }

    pub fn to_many_nodes(&self, id: NodeId, property: &str) -> Vec<NodeId> {
        self.with_node(id, |n| {
            n.to_many(property)
                .iter()
                .filter_map(Value::as_node)
                .collect()
        })
        .unwrap_or_default()
    }

    /// Every live node id, in allocation order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// A deep copy of the whole arena, ordered by id.
    pub fn export(&self) -> BTreeMap<NodeId, GraphNode> {
        self.nodes
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// True if `node`'s classifier is `classifier` or one of its generalizations.
    pub fn instance_of(&self, node: NodeId, classifier: NodeId) -> bool {
        match self.classifier(node) {
            Some(c) => self.specializes(c, classifier),
            None => false,
        }
    }

    /// True if `sub` is `sup` or reaches it through `generalizations`.
    pub fn specializes(&self, sub: NodeId, sup: NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([sub]);
        while let Some(current) = queue.pop_front() {
            if current == sup {
                return true;
            }
            if seen.insert(current) {
                queue.extend(self.to_many_nodes(current, m3::property::GENERALIZATIONS));
            }
        }
        false
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Applies `f` to the node, snapshotting it first if a transaction is
    /// open and the node predates it.
    fn mutate<R>(
        &self,
        id: NodeId,
        f: impl FnOnce(&mut GraphNode) -> Result<R, CoreError>,
    ) -> Result<R, CoreError> {
        let txn = self.open_transaction();
        let mut entry = self
            .nodes
            .get_mut(&id)
            .ok_or(CoreError::NodeNotFound { id })?;
        if let Some(txn) = txn {
            if !txn.is_new(id) {
                txn.register_modified_with(id, || entry.value().clone())?;
            }
        }
        f(entry.value_mut())
    }

    /// Sets a to-one property, replacing any previous value.
    pub fn set_to_one(&self, id: NodeId, property: &str, value: Value) -> Result<(), CoreError> {
        if property == CHILDREN {
            if let Value::Node(child) = value {
                return self.add_child(id, child);
            }
        }
        self.mutate(id, |n| n.set_to_one(property, value))
    }

    /// Appends to a to-many property. Values for `children` are routed
    /// through [`add_child`](Self::add_child).
    pub fn add_value(&self, id: NodeId, property: &str, value: Value) -> Result<(), CoreError> {
        if property == CHILDREN {
            if let Value::Node(child) = value {
                return self.add_child(id, child);
            }
        }
        self.mutate(id, |n| n.add_to_many(property, value))
    }

    /// Removes the first occurrence of `value`. Returns `false` (without
    /// touching the transaction) if it was not present.
    pub fn remove_value(&self, id: NodeId, property: &str, value: &Value) -> Result<bool, CoreError> {
        if property == CHILDREN {
            if let Value::Node(child) = value {
                return self.remove_child(id, *child);
            }
        }
        let present = self
            .with_node(id, |n| n.to_many(property).contains(value))
            .ok_or(CoreError::NodeNotFound { id })?;
        if !present {
            return Ok(false);
        }
        self.mutate(id, |n| Ok(n.remove_value(property, value)))
    }

    /// Removes a whole property. Returns `false` if it was not set.
    pub fn remove_property(&self, id: NodeId, property: &str) -> Result<bool, CoreError> {
        let present = self
            .with_node(id, |n| n.property(property).is_some())
            .ok_or(CoreError::NodeNotFound { id })?;
        if !present {
            return Ok(false);
        }
        self.mutate(id, |n| Ok(n.remove_property(property).is_some()))
    }

    pub fn set_classifier(&self, id: NodeId, classifier: NodeId) -> Result<(), CoreError> {
        self.mutate(id, |n| {
            n.set_classifier(classifier);
            Ok(())
        })
    }

    pub fn set_source_information(
        &self,
        id: NodeId,
        source: Option<SourceInformation>,
    ) -> Result<(), CoreError> {
        self.mutate(id, |n| {
            n.set_source_information(source);
            Ok(())
        })
    }

    pub fn add_compile_state(&self, id: NodeId, state: CompileState) -> Result<(), CoreError> {
        if self.has_state(id, state) {
            return Ok(());
        }
        self.mutate(id, |n| {
            n.add_state(state);
            Ok(())
        })
    }

    /// Clears flags. `MARKED_FOR_DELETION` can only be undone by rollback.
    pub fn remove_compile_state(&self, id: NodeId, state: CompileState) -> Result<(), CoreError> {
        if state.contains(CompileState::MARKED_FOR_DELETION) {
            return Err(CoreError::StickyState { node: id });
        }
        if !self.compile_states(id).intersects(state) {
            return Ok(());
        }
        self.mutate(id, |n| n.remove_state(state))
    }

    /// Appends `child` to `parent.children` and indexes it by name.
    pub fn add_child(&self, parent: NodeId, child: NodeId) -> Result<(), CoreError> {
        let name = self
            .name(child)
            .ok_or(CoreError::NodeNotFound { id: child })?;
        self.mutate(parent, |n| n.push_child(&name, child))
    }

    /// Removes `child` from `parent.children` and from the name index.
    pub fn remove_child(&self, parent: NodeId, child: NodeId) -> Result<bool, CoreError> {
        let name = self
            .name(child)
            .ok_or(CoreError::NodeNotFound { id: child })?;
        let present = self
            .with_node(parent, |n| n.children_named(&name).contains(&child))
            .ok_or(CoreError::NodeNotFound { id: parent })?;
        if !present {
            return Ok(false);
        }
        self.mutate(parent, |n| Ok(n.remove_child(&name, child)))
    }

    /// O(1) lookup of a child by name.
    pub fn find_in_children(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.with_node(parent, |n| n.child_by_name(name)).flatten()
    }

    // -----------------------------------------------------------------------
    // Top-level table
    // -----------------------------------------------------------------------

    /// Looks up a top-level name, seeing the open transaction's overlay.
    pub fn get_top_level(&self, name: &str) -> Option<NodeId> {
        if let Some(txn) = self.open_transaction() {
            if let Some(overlay) = txn.overlay_top_level(name) {
                return overlay;
            }
        }
        self.top_level.get(name).map(|e| *e.value())
    }

    /// Binds `name` to `node`, failing if a different node already holds it.
    pub fn add_top_level(&self, name: &str, node: NodeId) -> Result<(), CoreError> {
        let bound = self.get_or_add_top_level_named(name, node)?;
        if bound != node {
            return Err(CoreError::DuplicateTopLevel {
                name: name.to_string(),
                existing: bound,
            });
        }
        Ok(())
    }

    /// Returns the node bound to `node`'s name, binding `node` if the name is
    /// free. Inside a transaction the binding goes to the overlay and only
    /// reaches the base table at commit.
    pub fn get_or_add_top_level(&self, node: NodeId) -> Result<NodeId, CoreError> {
        let name = self.name(node).ok_or(CoreError::NodeNotFound { id: node })?;
        self.get_or_add_top_level_named(&name, node)
    }

    fn get_or_add_top_level_named(&self, name: &str, node: NodeId) -> Result<NodeId, CoreError> {
        let persistent = self
            .with_node(node, GraphNode::is_persistent)
            .ok_or(CoreError::NodeNotFound { id: node })?;
        if !persistent {
            return Err(CoreError::EphemeralTopLevel {
                name: name.to_string(),
                id: node,
            });
        }
        match self.open_transaction() {
            Some(txn) => {
                let committed = self.top_level.get(name).map(|e| *e.value());
                txn.get_or_add_top_level(name, node, committed)
            }
            None => Ok(*self
                .top_level
                .entry(name.to_string())
                .or_insert(node)
                .value()),
        }
    }

    /// Unbinds `name`. Inside a transaction this records a tombstone in the
    /// overlay.
    pub fn remove_top_level(&self, name: &str) -> Result<(), CoreError> {
        match self.open_transaction() {
            Some(txn) => txn.remove_top_level(name),
            None => {
                self.top_level.remove(name);
                Ok(())
            }
        }
    }

    /// Every visible top-level binding, sorted by name.
    pub fn top_levels(&self) -> Vec<(String, NodeId)> {
        let mut merged: BTreeMap<String, NodeId> = self
            .top_level
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        if let Some(txn) = self.open_transaction() {
            for (name, binding) in txn.overlay_entries() {
                match binding {
                    Some(id) => merged.insert(name, id),
                    None => merged.remove(&name),
                };
            }
        }
        merged.into_iter().collect()
    }

    // -----------------------------------------------------------------------
    // Package paths
    // -----------------------------------------------------------------------

    /// Resolves `a::b::C` by walking `children` from the `Root` package.
    /// A single segment also matches a top-level name.
    pub fn resolve_path(&self, path: &str) -> Option<NodeId> {
        if path.is_empty() || path == m3::ROOT {
            return self.get_top_level(m3::ROOT);
        }
        if !path.contains(PATH_SEPARATOR) {
            if let Some(top) = self.get_top_level(path) {
                return Some(top);
            }
        }
        let mut current = self.get_top_level(m3::ROOT)?;
        for segment in path.split(PATH_SEPARATOR) {
            current = self.find_in_children(current, segment)?;
        }
        Some(current)
    }

    /// Resolves a package path, creating missing packages along the way.
    /// The empty path is `Root`.
    pub fn get_or_create_package(&self, path: &str) -> Result<NodeId, CoreError> {
        let root = self
            .get_top_level(m3::ROOT)
            .ok_or_else(|| missing_metamodel(m3::ROOT))?;
        if path.is_empty() || path == m3::ROOT {
            return Ok(root);
        }
        let package_class = self
            .get_top_level(m3::PACKAGE)
            .ok_or_else(|| missing_metamodel(m3::PACKAGE))?;

        let mut current = root;
        for segment in path.split(PATH_SEPARATOR) {
            validate_name(segment)?;
            // Serialize the find-or-create on the parent container.
            let _guard = self.locks.nodes.lock(&current);
            current = match self.find_in_children(current, segment) {
                Some(existing) => existing,
                None => {
                    let package = self.create_node(segment, package_class, None, true)?;
                    self.set_to_one(package, m3::property::PACKAGE, Value::Node(current))?;
                    self.add_child(current, package)?;
                    tracing::trace!(package = segment, "created package");
                    package
                }
            };
        }
        Ok(current)
    }

    /// Full `a::b::C` path of a packaged node, or its name if it has no package.
    pub fn element_path(&self, id: NodeId) -> Option<String> {
        let mut segments = vec![self.name(id)?];
        let mut current = id;
        let mut seen = HashSet::new();
        while let Some(parent) = self.to_one_node(current, m3::property::PACKAGE) {
            if !seen.insert(parent) || self.name(parent).as_deref() == Some(m3::ROOT) {
                break;
            }
            segments.push(self.name(parent)?);
            current = parent;
        }
        segments.reverse();
        Some(segments.join(PATH_SEPARATOR))
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Opens a committable transaction.
    pub fn begin(&self) -> Result<Arc<Transaction>, CoreError> {
        self.begin_with(true)
    }

    /// Opens a transaction. Transactions are never nested.
    pub fn begin_with(&self, committable: bool) -> Result<Arc<Transaction>, CoreError> {
        let mut current = self.current.write();
        if let Some(open) = current.as_ref() {
            return Err(CoreError::TransactionAlreadyOpen { id: open.id() });
        }
        let id = TransactionId(self.next_transaction_id.fetch_add(1, Ordering::Relaxed));
        let txn = Arc::new(Transaction::new(id, committable));
        *current = Some(Arc::clone(&txn));
        tracing::debug!(transaction = %id, committable, "transaction opened");
        Ok(txn)
    }

    pub fn current_transaction(&self) -> Option<Arc<Transaction>> {
        self.current.read().clone()
    }

    fn open_transaction(&self) -> Option<Arc<Transaction>> {
        self.current
            .read()
            .as_ref()
            .filter(|t| t.is_open())
            .cloned()
    }

    /// Commits the open transaction: merges the top-level overlay, evicts
    /// nodes marked for deletion and ephemeral new nodes, discards snapshots
    /// and notifies the observer.
    pub fn commit(&self) -> Result<CommitSummary, CoreError> {
        let txn = self
            .current_transaction()
            .ok_or(CoreError::NoOpenTransaction)?;
        if !txn.is_committable() {
            return Err(CoreError::NotCommittable { id: txn.id() });
        }
        txn.begin_terminal(TransactionState::Committing, "commit")?;

        let new_nodes = txn.new_nodes();
        let modified: Vec<NodeId> = txn.take_modified().into_iter().map(|(id, _)| id).collect();

        let mut evicted = Vec::new();
        let mut added = Vec::new();
        for id in &new_nodes {
            let keep = self
                .with_node(*id, |n| {
                    n.is_persistent() && !n.has_state(CompileState::MARKED_FOR_DELETION)
                })
                .unwrap_or(false);
            if keep {
                added.push(*id);
            } else {
                evicted.push(*id);
            }
        }
        let mut kept_modified = Vec::new();
        for id in modified {
            if self.has_state(id, CompileState::MARKED_FOR_DELETION) {
                evicted.push(id);
            } else if self.contains(id) {
                kept_modified.push(id);
            }
        }

        for (name, binding) in txn.overlay_entries() {
            match binding {
                Some(id) => {
                    self.top_level.insert(name, id);
                }
                None => {
                    self.top_level.remove(&name);
                }
            }
        }
        let evicted_set: HashSet<NodeId> = evicted.iter().copied().collect();
        self.top_level.retain(|_, id| !evicted_set.contains(id));
        for id in &evicted {
            self.nodes.remove(id);
        }
        evicted.sort();

        txn.set_state(TransactionState::Committed);
        *self.current.write() = None;

        let observer = Arc::clone(&*self.observer.read());
        observer.added(&added);
        observer.modified(&kept_modified);

        tracing::info!(
            transaction = %txn.id(),
            added = added.len(),
            modified = kept_modified.len(),
            evicted = evicted.len(),
            "transaction committed"
        );
        Ok(CommitSummary {
            added,
            modified: kept_modified,
            evicted,
        })
    }

    /// Restores every snapshot, evicts every node created in the
    /// transaction and discards the top-level overlay.
    pub fn rollback(&self) -> Result<(), CoreError> {
        let txn = self
            .current_transaction()
            .ok_or(CoreError::NoOpenTransaction)?;
        txn.begin_terminal(TransactionState::RollingBack, "roll back")?;

        let restored = txn.take_modified();
        let restored_count = restored.len();
        for (id, snapshot) in restored {
            self.nodes.insert(id, snapshot);
        }
        let new_nodes = txn.new_nodes();
        for id in &new_nodes {
            self.nodes.remove(id);
        }

        txn.set_state(TransactionState::RolledBack);
        *self.current.write() = None;
        tracing::info!(
            transaction = %txn.id(),
            restored = restored_count,
            discarded = new_nodes.len(),
            "transaction rolled back"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Walks everything reachable from the top-level table and reports the
    /// first reference to a missing node or to a node marked for deletion.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeId> = self.top_levels().into_iter().map(|(_, id)| id).collect();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let refs: Vec<(String, NodeId)> = self
                .with_node(current, |n| {
                    let mut refs: Vec<(String, NodeId)> = n
                        .node_references()
                        .map(|(p, id)| (p.to_string(), id))
                        .collect();
                    if let Some(c) = n.classifier() {
                        refs.push(("classifier".to_string(), c));
                    }
                    refs
                })
                .unwrap_or_default();
            for (property, target) in refs {
                let live = self
                    .with_node(target, |n| !n.has_state(CompileState::MARKED_FOR_DELETION))
                    .unwrap_or(false);
                if !live {
                    return Err(CoreError::DanglingReference {
                        from: current,
                        property,
                        to: target,
                    });
                }
                stack.push(target);
            }
        }
        Ok(())
    }
}

impl Default for NodeRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::InvalidName {
            name: name.to_string(),
            reason: "name is empty",
        });
    }
    if name.contains(PATH_SEPARATOR) {
        return Err(CoreError::InvalidName {
            name: name.to_string(),
            reason: "name contains '::'",
        });
    }
    Ok(())
}

fn missing_metamodel(name: &str) -> CoreError {
    CoreError::InvalidName {
        name: name.to_string(),
        reason: "metamodel element is not bootstrapped",
    }
}
