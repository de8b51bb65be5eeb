//! Change detection between the registry's text and the compiled graph.
//!
//! Compares each source's current content hash with the hash of the text
//! it was last compiled from. Sources that never compiled are new, sources
//! whose hash moved are modified, and tombstoned sources are removed.

use std::collections::BTreeSet;

use crate::registry::SourceRegistry;

/// The set of sources a compilation batch has to process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Sources registered since the last successful compilation.
    pub new: BTreeSet<String>,
    /// Sources whose text changed since they were last compiled.
    pub modified: BTreeSet<String>,
    /// Compiled sources that have since been removed.
    pub removed: BTreeSet<String>,
}

impl ChangeSet {
    /// Sources whose text must be parsed (new + modified).
    pub fn needs_parse(&self) -> BTreeSet<String> {
        self.new.union(&self.modified).cloned().collect()
    }

    /// Sources whose previously compiled nodes must be unbound
    /// (modified + removed).
    pub fn needs_unbind(&self) -> BTreeSet<String> {
        self.modified.union(&self.removed).cloned().collect()
    }

    /// Every source in the set, sorted.
    pub fn all(&self) -> BTreeSet<String> {
        self.new
            .iter()
            .chain(&self.modified)
            .chain(&self.removed)
            .cloned()
            .collect()
    }

    /// Returns true if nothing changed.
    pub fn is_clean(&self) -> bool {
        self.new.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.new.len() + self.modified.len() + self.removed.len()
    }

    /// Only the removals, for unload-only batches.
    pub fn removals_only(&self) -> ChangeSet {
        ChangeSet {
            removed: self.removed.clone(),
            ..ChangeSet::default()
        }
    }
}

/// Computes the change set of the registry against its compiled state.
pub fn compute_change_set(registry: &SourceRegistry) -> ChangeSet {
    let mut changes = ChangeSet::default();
    for entry in registry.entries() {
        if entry.is_deleted() {
            changes.removed.insert(entry.id().to_string());
        } else if entry.compiled_hash().is_none() {
            changes.new.insert(entry.id().to_string());
        } else if entry.is_stale() {
            changes.modified.insert(entry.id().to_string());
        }
    }
    changes
}
