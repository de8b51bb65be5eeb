//! Graph node data model.
//!
//! A [`GraphNode`] is an instance of some classifier: a name, a classifier
//! reference, optional [`SourceInformation`], a bag of named [`Property`]
//! values and a small set of [`CompileState`] flags. Nodes are owned by the
//! [`NodeRepository`](crate::repository::NodeRepository) and only ever
//! mutated through it, so that open transactions can capture snapshots.
//!
//! The `children` property is special: the node keeps a name index over it
//! so that child lookup by name is O(1).

use std::collections::HashMap;

use bitflags::bitflags;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::CoreError;
use crate::id::NodeId;
use crate::source_info::SourceInformation;

/// Name of the containment property indexed by child name.
pub const CHILDREN: &str = "children";

/// A single property value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Node(NodeId),
    String(String),
    Integer(i64),
    Boolean(bool),
}

impl Value {
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Value::Node(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<NodeId> for Value {
    fn from(id: NodeId) -> Self {
        Value::Node(id)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// Whether a property holds exactly one value or an ordered list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Multiplicity {
    ToOne,
    ToMany,
}

/// A property's values together with its multiplicity. The multiplicity is
/// fixed the first time the property is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    multiplicity: Multiplicity,
    values: SmallVec<[Value; 2]>,
}

impl Property {
    pub fn multiplicity(&self) -> Multiplicity {
        self.multiplicity
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

bitflags! {
    /// Compile-state flags carried by every node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CompileState: u8 {
        /// The node has been bound.
        const PROCESSED = 1;
        /// The node has passed validation.
        const VALIDATED = 1 << 1;
        /// The node is scheduled for eviction when the current batch commits.
        const MARKED_FOR_DELETION = 1 << 2;
    }
}

/// A node in the model graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    id: NodeId,
    name: String,
    classifier: Option<NodeId>,
    source: Option<SourceInformation>,
    properties: IndexMap<String, Property>,
    /// Child name -> children with that name, in insertion order.
    children_index: HashMap<String, SmallVec<[NodeId; 1]>>,
    states: CompileState,
    persistent: bool,
}

impl GraphNode {
    pub(crate) fn new(
        id: NodeId,
        name: String,
        classifier: Option<NodeId>,
        source: Option<SourceInformation>,
        persistent: bool,
    ) -> Self {
        GraphNode {
            id,
            name,
            classifier,
            source,
            properties: IndexMap::new(),
            children_index: HashMap::new(),
            states: CompileState::empty(),
            persistent,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn classifier(&self) -> Option<NodeId> {
        self.classifier
    }

    pub fn source_information(&self) -> Option<&SourceInformation> {
        self.source.as_ref()
    }

    /// Ephemeral (non-persistent) nodes never survive a commit.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn compile_states(&self) -> CompileState {
        self.states
    }

    pub fn has_state(&self, state: CompileState) -> bool {
        self.states.contains(state)
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The single value of a to-one property.
    pub fn to_one(&self, name: &str) -> Option<&Value> {
        self.properties.get(name).and_then(|p| p.values.first())
    }

    /// All values of a property, empty if unset.
    pub fn to_many(&self, name: &str) -> &[Value] {
        self.properties
            .get(name)
            .map(|p| p.values.as_slice())
            .unwrap_or(&[])
    }

    /// Every node referenced by a property value, with the property name.
    pub fn node_references(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.properties.iter().flat_map(|(name, prop)| {
            prop.values
                .iter()
                .filter_map(move |v| v.as_node().map(|id| (name.as_str(), id)))
        })
    }

    /// First child registered under `name`.
    pub fn child_by_name(&self, name: &str) -> Option<NodeId> {
        self.children_index
            .get(name)
            .and_then(|ids| ids.first().copied())
    }

    /// All children registered under `name`, in insertion order.
    pub fn children_named(&self, name: &str) -> &[NodeId] {
        self.children_index
            .get(name)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }

    // -----------------------------------------------------------------------
    // Mutation (repository only)
    // -----------------------------------------------------------------------

    pub(crate) fn set_classifier(&mut self, classifier: NodeId) {
        self.classifier = Some(classifier);
    }

    pub(crate) fn set_source_information(&mut self, source: Option<SourceInformation>) {
        self.source = source;
    }

    pub(crate) fn set_to_one(&mut self, property: &str, value: Value) -> Result<(), CoreError> {
        self.check_multiplicity(property, Multiplicity::ToOne)?;
        let p = self.entry(property, Multiplicity::ToOne);
        p.values.clear();
        p.values.push(value);
        Ok(())
    }

    pub(crate) fn add_to_many(&mut self, property: &str, value: Value) -> Result<(), CoreError> {
        self.check_multiplicity(property, Multiplicity::ToMany)?;
        self.entry(property, Multiplicity::ToMany).values.push(value);
        Ok(())
    }

    /// Removes the first occurrence of `value`. Empty properties are dropped.
    /// Children go through [`remove_child`](Self::remove_child) so the name
    /// index stays in sync.
    pub(crate) fn remove_value(&mut self, property: &str, value: &Value) -> bool {
        let Some(p) = self.properties.get_mut(property) else {
            return false;
        };
        let Some(pos) = p.values.iter().position(|v| v == value) else {
            return false;
        };
        p.values.remove(pos);
        if p.values.is_empty() {
            self.properties.shift_remove(property);
        }
        true
    }

    /// Removes `child`, registered under `name`, from `children`.
    pub(crate) fn remove_child(&mut self, name: &str, child: NodeId) -> bool {
        if !self.remove_value(CHILDREN, &Value::Node(child)) {
            return false;
        }
        if let Some(ids) = self.children_index.get_mut(name) {
            ids.retain(|id| *id != child);
            if ids.is_empty() {
                self.children_index.remove(name);
            }
        }
        true
    }

    pub(crate) fn remove_property(&mut self, property: &str) -> Option<Property> {
        let removed = self.properties.shift_remove(property);
        if property == CHILDREN && removed.is_some() {
            self.children_index.clear();
        }
        removed
    }

    pub(crate) fn push_child(&mut self, name: &str, child: NodeId) -> Result<(), CoreError> {
        self.add_to_many(CHILDREN, Value::Node(child))?;
        self.children_index
            .entry(name.to_string())
            .or_default()
            .push(child);
        Ok(())
    }

    pub(crate) fn add_state(&mut self, state: CompileState) {
        self.states.insert(state);
    }

    pub(crate) fn remove_state(&mut self, state: CompileState) -> Result<(), CoreError> {
        if state.contains(CompileState::MARKED_FOR_DELETION) {
            return Err(CoreError::StickyState { node: self.id });
        }
        self.states.remove(state);
        Ok(())
    }

    fn check_multiplicity(&self, property: &str, wanted: Multiplicity) -> Result<(), CoreError> {
        match self.properties.get(property) {
            Some(p) if p.multiplicity != wanted => Err(CoreError::MultiplicityMismatch {
                node: self.id,
                property: property.to_string(),
                expected: p.multiplicity,
            }),
            _ => Ok(()),
        }
    }

    fn entry(&mut self, property: &str, multiplicity: Multiplicity) -> &mut Property {
        self.properties
            .entry(property.to_string())
            .or_insert_with(|| Property {
                multiplicity,
                values: SmallVec::new(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> GraphNode {
        GraphNode::new(NodeId(1), "n".into(), None, None, true)
    }

    #[test]
    fn to_one_replaces_previous_value() {
        let mut n = node();
        n.set_to_one("p", Value::Integer(1)).unwrap();
        n.set_to_one("p", Value::Integer(2)).unwrap();
        assert_eq!(n.to_one("p"), Some(&Value::Integer(2)));
        assert_eq!(n.to_many("p").len(), 1);
    }

    #[test]
    fn multiplicity_is_fixed_on_first_write() {
        let mut n = node();
        n.add_to_many("p", Value::Boolean(true)).unwrap();
        let err = n.set_to_one("p", Value::Boolean(false)).unwrap_err();
        assert!(matches!(err, CoreError::MultiplicityMismatch { .. }));

        n.set_to_one("q", Value::Integer(1)).unwrap();
        assert!(n.add_to_many("q", Value::Integer(2)).is_err());
    }

    #[test]
    fn removing_last_value_drops_property() {
        let mut n = node();
        n.add_to_many("p", Value::Node(NodeId(4))).unwrap();
        assert!(n.remove_value("p", &Value::Node(NodeId(4))));
        assert!(n.property("p").is_none());
        assert!(!n.remove_value("p", &Value::Node(NodeId(4))));
    }

    #[test]
    fn children_index_tracks_duplicates_in_order() {
        let mut n = node();
        n.push_child("Foo", NodeId(2)).unwrap();
        n.push_child("Foo", NodeId(3)).unwrap();
        assert_eq!(n.child_by_name("Foo"), Some(NodeId(2)));
        assert_eq!(n.children_named("Foo"), &[NodeId(2), NodeId(3)]);

        n.push_child("Bar", NodeId(4)).unwrap();

        assert!(n.remove_child("Foo", NodeId(2)));
        assert_eq!(n.child_by_name("Foo"), Some(NodeId(3)));
        assert!(n.remove_child("Foo", NodeId(3)));
        assert_eq!(n.child_by_name("Foo"), None);
        assert!(n.children_named("Foo").is_empty());
        assert!(!n.remove_child("Foo", NodeId(3)));
        assert_eq!(n.child_by_name("Bar"), Some(NodeId(4)));
        assert_eq!(n.to_many(CHILDREN), &[Value::Node(NodeId(4))]);
    }

    #[test]
    fn marked_for_deletion_is_sticky() {
        let mut n = node();
        n.add_state(CompileState::PROCESSED | CompileState::MARKED_FOR_DELETION);
        assert!(n.remove_state(CompileState::MARKED_FOR_DELETION).is_err());
        n.remove_state(CompileState::PROCESSED).unwrap();
        assert!(!n.has_state(CompileState::PROCESSED));
        assert!(n.has_state(CompileState::MARKED_FOR_DELETION));
    }

    #[test]
    fn node_references_skip_primitive_values() {
        let mut n = node();
        n.set_to_one("name", Value::from("x")).unwrap();
        n.add_to_many("refs", Value::Node(NodeId(5))).unwrap();
        n.add_to_many("refs", Value::Node(NodeId(6))).unwrap();
        let refs: Vec<_> = n.node_references().collect();
        assert_eq!(refs, vec![("refs", NodeId(5)), ("refs", NodeId(6))]);
    }
}
