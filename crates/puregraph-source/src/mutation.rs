//! Graph-driven edits to source text.
//!
//! A [`SourceMutation`] collects, during one compilation batch, the nodes
//! that processors decided to delete and the source lines those nodes came
//! from. Marking is immediate (the node gets
//! [`CompileState::MARKED_FOR_DELETION`] through the repository, so the open
//! transaction snapshots it); the text edits are applied afterwards by
//! [`SourceMutation::perform`], which rewrites the affected sources in the
//! registry so the next batch recompiles them.
//!
//! Line ranges are 1-based and inclusive.

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde::Serialize;

use puregraph_core::{CompileState, NodeId, NodeRepository};

use crate::error::SourceError;
use crate::registry::SourceRegistry;

#[derive(Debug, Default)]
struct MutationState {
    line_ranges: IndexMap<String, Vec<(u32, u32)>>,
    marked: IndexSet<NodeId>,
}

/// Deletions requested during one batch. Safe to share between workers.
#[derive(Debug, Default)]
pub struct SourceMutation {
    state: Mutex<MutationState>,
}

/// Serializable summary of a [`SourceMutation`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MutationReport {
    pub modified_files: Vec<String>,
    pub line_ranges: IndexMap<String, Vec<(u32, u32)>>,
    pub marked_nodes: usize,
}

impl SourceMutation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags `node` for eviction at commit without touching any text.
    /// Returns `true` if the node was not already marked.
    pub fn mark_for_deletion(
        &self,
        repo: &NodeRepository,
        node: NodeId,
    ) -> Result<bool, SourceError> {
        repo.add_compile_state(node, CompileState::MARKED_FOR_DELETION)?;
        Ok(self.state.lock().marked.insert(node))
    }

    /// Marks `node` for deletion and schedules the lines it spans for
    /// removal from its source.
    pub fn delete(&self, repo: &NodeRepository, node: NodeId) -> Result<(), SourceError> {
        self.mark_for_deletion(repo, node)?;
        if let Some(info) = repo.source_information(node) {
            self.delete_lines(info.source_id(), info.start_line(), info.end_line());
        }
        Ok(())
    }

    /// Schedules `start..=end` of `source_id` for removal.
    pub fn delete_lines(&self, source_id: &str, start: u32, end: u32) {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        self.state
            .lock()
            .line_ranges
            .entry(source_id.to_string())
            .or_default()
            .push((start, end));
    }

    pub fn marked_nodes(&self) -> Vec<NodeId> {
        self.state.lock().marked.iter().copied().collect()
    }

    /// Sources with at least one line scheduled for removal, sorted.
    pub fn modified_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.state.lock().line_ranges.keys().cloned().collect();
        files.sort();
        files
    }

    /// Sorted, merged line ranges to remove from `source_id`.
    pub fn line_ranges_to_remove(&self, source_id: &str) -> Vec<(u32, u32)> {
        let ranges = self
            .state
            .lock()
            .line_ranges
            .get(source_id)
            .cloned()
            .unwrap_or_default();
        merge_ranges(ranges)
    }

    /// True if no text edits are scheduled. Marked nodes alone do not count.
    pub fn is_empty(&self) -> bool {
        self.state.lock().line_ranges.is_empty()
    }

    pub fn report(&self) -> MutationReport {
        let files = self.modified_files();
        let line_ranges = files
            .iter()
            .map(|f| (f.clone(), self.line_ranges_to_remove(f)))
            .collect();
        MutationReport {
            modified_files: files,
            line_ranges,
            marked_nodes: self.state.lock().marked.len(),
        }
    }

    /// Applies the scheduled line removals to the registry. Returns the ids
    /// of the sources that were rewritten.
    pub fn perform(&self, registry: &mut SourceRegistry) -> Result<Vec<String>, SourceError> {
        let mut rewritten = Vec::new();
        for file in self.modified_files() {
            let ranges = self.line_ranges_to_remove(&file);
            let content = registry.get_content(&file)?;
            let line_count = content.split_inclusive('\n').count() as u32;
            if let Some(&(start, end)) = ranges
                .iter()
                .find(|(start, end)| *start == 0 || *end > line_count)
            {
                return Err(SourceError::InvalidLineRange {
                    source_id: file,
                    start,
                    end,
                });
            }
            let updated = remove_lines(content, &ranges);
            registry.modify(&file, &updated)?;
            tracing::info!(source = %file, ranges = ranges.len(), "source rewritten");
            rewritten.push(file);
        }
        Ok(rewritten)
    }
}

/// Removes the given 1-based inclusive line ranges from `text`, keeping the
/// remaining lines (and their terminators) intact.
pub fn remove_lines(text: &str, ranges: &[(u32, u32)]) -> String {
    text.split_inclusive('\n')
        .enumerate()
        .filter(|(i, _)| {
            let line = *i as u32 + 1;
            !ranges.iter().any(|(s, e)| (*s..=*e).contains(&line))
        })
        .map(|(_, l)| l)
        .collect()
}

fn merge_ranges(mut ranges: Vec<(u32, u32)>) -> Vec<(u32, u32)> {
    ranges.sort_unstable();
    let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1.saturating_add(1) => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use puregraph_core::m3;
    use puregraph_core::SourceInformation;

    use super::*;

    #[test]
    fn ranges_are_merged_and_sorted() {
        let mutation = SourceMutation::new();
        mutation.delete_lines("/a.pure", 7, 9);
        mutation.delete_lines("/a.pure", 2, 3);
        mutation.delete_lines("/a.pure", 4, 4);
        mutation.delete_lines("/a.pure", 8, 12);
        assert_eq!(
            mutation.line_ranges_to_remove("/a.pure"),
            vec![(2, 4), (7, 12)]
        );
        assert!(mutation.line_ranges_to_remove("/b.pure").is_empty());
    }

    #[test]
    fn remove_lines_keeps_terminators() {
        let text = "one\ntwo\nthree\nfour";
        assert_eq!(remove_lines(text, &[(2, 3)]), "one\nfour");
        assert_eq!(remove_lines(text, &[(4, 4)]), "one\ntwo\nthree\n");
        assert_eq!(remove_lines(text, &[]), text);
    }

    #[test]
    fn delete_marks_node_and_records_span() {
        let repo = NodeRepository::bootstrapped().unwrap();
        let class = repo.get_top_level(m3::CLASS).unwrap();
        let info = SourceInformation::new("/a.pure", 3, 1, 5, 1);
        let node = repo.create_node("Gone", class, Some(info), true).unwrap();

        let mutation = SourceMutation::new();
        mutation.delete(&repo, node).unwrap();
        assert!(repo.has_state(node, CompileState::MARKED_FOR_DELETION));
        assert_eq!(mutation.modified_files(), vec!["/a.pure".to_string()]);
        assert_eq!(mutation.line_ranges_to_remove("/a.pure"), vec![(3, 5)]);
        assert_eq!(mutation.marked_nodes(), vec![node]);
        assert!(!mutation.mark_for_deletion(&repo, node).unwrap());
    }

    #[test]
    fn perform_rewrites_registry() {
        let mut registry = SourceRegistry::new();
        registry.add_or_replace("/a.pure", "a\nb\nc\nd\n");
        let mutation = SourceMutation::new();
        mutation.delete_lines("/a.pure", 2, 3);

        let rewritten = mutation.perform(&mut registry).unwrap();
        assert_eq!(rewritten, vec!["/a.pure".to_string()]);
        assert_eq!(registry.get_content("/a.pure").unwrap(), "a\nd\n");
        assert_eq!(registry.version("/a.pure").unwrap().number, 2);
    }

    #[test]
    fn perform_rejects_out_of_range_lines() {
        let mut registry = SourceRegistry::new();
        registry.add_or_replace("/a.pure", "a\nb\n");
        let mutation = SourceMutation::new();
        mutation.delete_lines("/a.pure", 2, 5);
        let err = mutation.perform(&mut registry).unwrap_err();
        assert!(matches!(err, SourceError::InvalidLineRange { end: 5, .. }));
        assert_eq!(registry.get_content("/a.pure").unwrap(), "a\nb\n");
    }

    #[test]
    fn report_summarizes_mutation() {
        let mutation = SourceMutation::new();
        mutation.delete_lines("/b.pure", 1, 1);
        mutation.delete_lines("/a.pure", 4, 2);
        let report = mutation.report();
        assert_eq!(report.modified_files, vec!["/a.pure", "/b.pure"]);
        assert_eq!(report.line_ranges["/a.pure"], vec![(2, 4)]);
        assert_eq!(report.marked_nodes, 0);
    }

    proptest::proptest! {
        #[test]
        fn removed_lines_are_exactly_the_covered_ones(
            line_count in 1u32..40,
            raw_ranges in proptest::collection::vec((1u32..40, 0u32..5), 0..6),
        ) {
            let text: String = (1..=line_count).map(|i| format!("line {i}\n")).collect();
            let ranges: Vec<(u32, u32)> = raw_ranges
                .into_iter()
                .map(|(start, len)| (start.min(line_count), (start + len).min(line_count)))
                .collect();
            let merged = merge_ranges(ranges.clone());

            let kept: Vec<u32> = remove_lines(&text, &merged)
                .lines()
                .map(|l| l.trim_start_matches("line ").parse().unwrap())
                .collect();
            let expected: Vec<u32> = (1..=line_count)
                .filter(|l| !ranges.iter().any(|(s, e)| (*s..=*e).contains(l)))
                .collect();
            proptest::prop_assert_eq!(kept, expected);
            for pair in merged.windows(2) {
                proptest::prop_assert!(pair[0].1 + 1 < pair[1].0);
            }
        }
    }
}
