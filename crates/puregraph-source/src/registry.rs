//! The source registry: source id -> text, version, and compiled nodes.
//!
//! Registering text never parses it. Each entry remembers the blake3 hash of
//! the text that was last compiled successfully, so staleness is a hash
//! comparison (see [`compute_change_set`](crate::changes::compute_change_set)).
//! Removing a compiled source leaves a tombstone until the compiler has
//! unbound its nodes and calls [`SourceRegistry::purge`].

use std::collections::HashMap;

use indexmap::IndexMap;

use puregraph_core::NodeId;

use crate::error::SourceError;

/// Content version of a source. The number increments only when the text
/// actually changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceVersion {
    pub number: u64,
    pub hash: blake3::Hash,
}

/// Registry entry for one source.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    id: String,
    content: String,
    version: SourceVersion,
    compiled: Option<blake3::Hash>,
    nodes: Vec<NodeId>,
    deleted: bool,
}

impl SourceEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> SourceVersion {
        self.version
    }

    /// Hash of the text the current graph was compiled from.
    pub fn compiled_hash(&self) -> Option<blake3::Hash> {
        self.compiled
    }

    /// Top-level nodes declared by the last successful compilation.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// True if the text differs from what was last compiled, or the source
    /// was removed.
    pub fn is_stale(&self) -> bool {
        self.deleted || self.compiled != Some(self.version.hash)
    }
}

/// Hashes source text.
pub fn hash_content(text: &str) -> blake3::Hash {
    blake3::hash(text.as_bytes())
}

/// Source id -> [`SourceEntry`], in registration order.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    entries: IndexMap<String, SourceEntry>,
    node_sources: HashMap<NodeId, String>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Content
    // -----------------------------------------------------------------------

    /// Registers or replaces the text of a source. Re-registering identical
    /// text keeps the current version.
    pub fn add_or_replace(&mut self, id: &str, text: &str) -> SourceVersion {
        let hash = hash_content(text);
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.deleted = false;
                if entry.version.hash != hash {
                    entry.version = SourceVersion {
                        number: entry.version.number + 1,
                        hash,
                    };
                    entry.content = text.to_string();
                }
                entry.version
            }
            None => {
                let version = SourceVersion { number: 1, hash };
                self.entries.insert(
                    id.to_string(),
                    SourceEntry {
                        id: id.to_string(),
                        content: text.to_string(),
                        version,
                        compiled: None,
                        nodes: Vec::new(),
                        deleted: false,
                    },
                );
                tracing::debug!(source = id, "source registered");
                version
            }
        }
    }

    /// Replaces the text of an existing source.
    pub fn modify(&mut self, id: &str, text: &str) -> Result<SourceVersion, SourceError> {
        if !self.contains(id) {
            return Err(unknown(id));
        }
        Ok(self.add_or_replace(id, text))
    }

    /// Removes a source. A source with compiled nodes stays as a tombstone
    /// until its nodes are unbound; an uncompiled one is dropped at once.
    pub fn remove(&mut self, id: &str) -> Result<(), SourceError> {
        let entry = self
            .entries
            .get_mut(id)
            .filter(|e| !e.deleted)
            .ok_or_else(|| unknown(id))?;
        if entry.compiled.is_some() {
            entry.deleted = true;
        } else {
            self.entries.shift_remove(id);
        }
        tracing::debug!(source = id, "source removed");
        Ok(())
    }

    pub fn get_content(&self, id: &str) -> Result<&str, SourceError> {
        self.live(id)
            .map(SourceEntry::content)
            .ok_or_else(|| unknown(id))
    }

    pub fn version(&self, id: &str) -> Option<SourceVersion> {
        self.live(id).map(SourceEntry::version)
    }

    /// True if `id` is registered and not removed.
    pub fn contains(&self, id: &str) -> bool {
        self.live(id).is_some()
    }

    /// Any entry, including tombstones.
    pub fn entry(&self, id: &str) -> Option<&SourceEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &SourceEntry> {
        self.entries.values()
    }

    /// Live source ids, sorted.
    pub fn source_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .entries
            .values()
            .filter(|e| !e.deleted)
            .map(|e| e.id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    fn live(&self, id: &str) -> Option<&SourceEntry> {
        self.entries.get(id).filter(|e| !e.deleted)
    }

    // -----------------------------------------------------------------------
    // Compiled nodes
    // -----------------------------------------------------------------------

    /// Top-level nodes of the last successful compilation of `id`.
    pub fn nodes(&self, id: &str) -> &[NodeId] {
        self.entries
            .get(id)
            .map(|e| e.nodes.as_slice())
            .unwrap_or(&[])
    }

    /// Source that declared `node` as a top-level node.
    pub fn source_of(&self, node: NodeId) -> Option<&str> {
        self.node_sources.get(&node).map(String::as_str)
    }

    /// True if `node` is a top-level node of some source.
    pub fn is_declared(&self, node: NodeId) -> bool {
        self.node_sources.contains_key(&node)
    }

    /// Records that the current text of `id` compiled into `nodes`.
    pub fn mark_compiled(&mut self, id: &str, nodes: Vec<NodeId>) -> Result<(), SourceError> {
        let entry = self.entries.get_mut(id).ok_or_else(|| unknown(id))?;
        for old in entry.nodes.drain(..) {
            self.node_sources.remove(&old);
        }
        for node in &nodes {
            self.node_sources.insert(*node, id.to_string());
        }
        entry.nodes = nodes;
        entry.compiled = Some(entry.version.hash);
        Ok(())
    }

    /// Drops a tombstoned source together with its node mappings.
    pub fn purge(&mut self, id: &str) -> Result<(), SourceError> {
        let entry = self
            .entries
            .get(id)
            .filter(|e| e.deleted)
            .ok_or_else(|| unknown(id))?;
        for node in &entry.nodes {
            self.node_sources.remove(node);
        }
        self.entries.shift_remove(id);
        Ok(())
    }
}

fn unknown(id: &str) -> SourceError {
    SourceError::UnknownSource {
        source_id: id.to_string(),
    }
}
