//! The incremental compiler.
//!
//! [`IncrementalCompiler`] owns a [`SourceRegistry`], a [`Matcher`] with the
//! built-in processors and the registered [`Parser`]s, and compiles the
//! registry's changes into a shared [`NodeRepository`] one batch at a time.
//!
//! # Batches
//!
//! A batch runs inside a single repository transaction:
//!
//! 1. compute the change set and the [exclusion set](crate::exclusion)
//! 2. unbind-walk and unbind the stale nodes, unbind their dependents and
//!    mark the stale nodes for deletion
//! 3. parse the new and modified sources
//! 4. bind and validate the parsed roots and the dependents
//! 5. commit and record the new compiled state in the registry
//!
//! Any error rolls the transaction back, which restores every node touched
//! in steps 2 to 4 and discards every node created in step 3. The registry
//! is only updated after a successful commit, so a failed batch can simply
//! be retried once the sources are fixed.
//!
//! Processors may request text edits through the batch's
//! [`SourceMutation`]; `compile` applies them and runs another batch, up to
//! [`CompilerOptions::max_mutation_rounds`] times.

use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;

use puregraph_core::{CompileState, NodeId, NodeRepository, SourceInformation};
use puregraph_source::{
    compute_change_set, ChangeSet, MutationReport, SourceMutation, SourceRegistry, SourceVersion,
};

use crate::context::{BatchScope, ProcessContext};
use crate::error::CompileError;
use crate::exclusion::compute_exclusion;
use crate::matcher::{Matcher, Stage, VisitedSet};
use crate::options::CompilerOptions;
use crate::parser::{split_sections, DeclarationParser, ParseContext, Parser};
use crate::processors;

/// Where the compiler is within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    Idle,
    ComputingDelta,
    UnbindingStale,
    Parsing,
    Binding,
    Validating,
    Committing,
    Failed,
    RollingBack,
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchPhase::Idle => "idle",
            BatchPhase::ComputingDelta => "computing-delta",
            BatchPhase::UnbindingStale => "unbinding-stale",
            BatchPhase::Parsing => "parsing",
            BatchPhase::Binding => "binding",
            BatchPhase::Validating => "validating",
            BatchPhase::Committing => "committing",
            BatchPhase::Failed => "failed",
            BatchPhase::RollingBack => "rolling-back",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchMode {
    /// Unbind, parse, bind, validate and commit.
    Compile,
    /// Unbind removed sources and commit. Dependents stay unbound until the
    /// next compile.
    Unload,
    /// Like `Compile`, in a non-committable transaction that is always
    /// rolled back.
    Check,
}

/// What one batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Sources parsed in this batch.
    pub compiled: Vec<String>,
    /// Sources whose nodes were removed for good.
    pub removed: Vec<String>,
    pub parsed_nodes: usize,
    pub unbound_nodes: usize,
    pub rebound_dependents: usize,
    /// Implicit packages removed because the batch left them empty.
    pub pruned_packages: usize,
    pub added: usize,
    pub modified: usize,
    pub evicted: usize,
    /// Source edits requested by processors during the batch.
    pub mutation: MutationReport,
}

/// Result of [`IncrementalCompiler::compile`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompileReport {
    pub batches: Vec<BatchReport>,
}

impl CompileReport {
    /// True if there was nothing to compile.
    pub fn is_noop(&self) -> bool {
        self.batches.is_empty()
    }

    /// Every source rewritten by a source mutation, in order.
    pub fn rewritten_sources(&self) -> Vec<String> {
        self.batches
            .iter()
            .flat_map(|b| b.mutation.modified_files.iter().cloned())
            .collect()
    }
}

/// Output of a batch's processing, before commit.
struct Processed {
    parsed: Vec<(String, Vec<NodeId>)>,
    removed_sources: Vec<String>,
    unbound: usize,
    dependents: Vec<NodeId>,
    rebound: usize,
    pruned: usize,
}

/// Compiles sources into a [`NodeRepository`], incrementally.
pub struct IncrementalCompiler {
    repository: Arc<NodeRepository>,
    registry: SourceRegistry,
    matcher: Matcher,
    parsers: IndexMap<String, Box<dyn Parser>>,
    options: CompilerOptions,
    phase: Mutex<BatchPhase>,
    /// Dependents unbound by `unload` that still have to be bound again.
    pending_rebind: IndexSet<NodeId>,
}

impl fmt::Debug for IncrementalCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncrementalCompiler")
            .field("sources", &self.registry.source_ids())
            .field("parsers", &self.parsers.keys().collect::<Vec<_>>())
            .field("options", &self.options)
            .field("phase", &*self.phase.lock())
            .field("pending_rebind", &self.pending_rebind)
            .finish()
    }
}

impl IncrementalCompiler {
    /// Creates a compiler over a bootstrapped repository, with the built-in
    /// processors and [`DeclarationParser`] registered.
    pub fn new(
        repository: Arc<NodeRepository>,
        options: CompilerOptions,
    ) -> Result<Self, CompileError> {
        let mut matcher = Matcher::new();
        processors::register_all(&mut matcher, &repository)?;
        let mut compiler = IncrementalCompiler {
            repository,
            registry: SourceRegistry::new(),
            matcher,
            parsers: IndexMap::new(),
            options,
            phase: Mutex::new(BatchPhase::Idle),
            pending_rebind: IndexSet::new(),
        };
        compiler.register_parser(DeclarationParser);
        Ok(compiler)
    }

    /// Creates a compiler over a fresh bootstrapped repository.
    pub fn bootstrapped(options: CompilerOptions) -> Result<Self, CompileError> {
        let repository = Arc::new(NodeRepository::bootstrapped()?);
        Self::new(repository, options)
    }

    pub fn repository(&self) -> &Arc<NodeRepository> {
        &self.repository
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn phase(&self) -> BatchPhase {
        *self.phase.lock()
    }

    /// Nodes waiting to be bound again after an [`unload`](Self::unload).
    pub fn pending_rebind(&self) -> Vec<NodeId> {
        self.pending_rebind.iter().copied().collect()
    }

    /// Handler registration. The matcher's caches are dropped by every
    /// registration.
    pub fn matcher_mut(&mut self) -> &mut Matcher {
        &mut self.matcher
    }

    /// Registers a handler for instances of the classifier at `path`.
    pub fn register_handler<F>(
        &mut self,
        path: &str,
        stage: Stage,
        handler: F,
    ) -> Result<(), CompileError>
    where
        F: Fn(&ProcessContext<'_>, NodeId) -> Result<(), CompileError> + Send + Sync + 'static,
    {
        self.matcher
            .register(&self.repository, path, stage, handler)
    }

    /// Registers `parser` for its section name, replacing any parser
    /// already registered under that name.
    pub fn register_parser<P: Parser + 'static>(&mut self, parser: P) {
        let name = parser.name().to_string();
        tracing::debug!(parser = %name, "parser registered");
        self.parsers.insert(name, Box::new(parser));
    }

    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    /// Registers or replaces a source. Nothing is compiled until
    /// [`compile`](Self::compile).
    pub fn add_or_replace_source(&mut self, id: &str, text: &str) -> SourceVersion {
        self.registry.add_or_replace(id, text)
    }

    pub fn modify_source(&mut self, id: &str, text: &str) -> Result<SourceVersion, CompileError> {
        Ok(self.registry.modify(id, text)?)
    }

    pub fn delete_source(&mut self, id: &str) -> Result<(), CompileError> {
        Ok(self.registry.remove(id)?)
    }

    /// Pending changes against the compiled state.
    pub fn changes(&self) -> ChangeSet {
        compute_change_set(&self.registry)
    }

    // -----------------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------------

    /// Compiles every pending change. Returns one report per batch run;
    /// more than one batch runs when processors rewrote sources.
    ///
    /// Each batch commits on its own. If a later round fails, the batches
    /// before it stay committed, the error is returned and the rewritten
    /// sources stay pending for the next call.
    pub fn compile(&mut self) -> Result<CompileReport, CompileError> {
        let mut report = CompileReport::default();
        let rounds = self.options.max_mutation_rounds.max(1);
        for round in 1..=rounds {
            let changes = compute_change_set(&self.registry);
            if changes.is_clean() && self.pending_rebind.is_empty() {
                break;
            }
            let (batch, mutation) = self.run_batch(&changes, BatchMode::Compile)?;
            report.batches.push(batch);

            if mutation.is_empty() || !self.options.apply_source_mutations {
                break;
            }
            let rewritten = mutation.perform(&mut self.registry)?;
            tracing::info!(round, rewritten = ?rewritten, "source mutation applied");
            if round == rounds {
                tracing::warn!(rounds, "mutation round limit reached; rewritten sources stay pending");
            }
        }
        Ok(report)
    }

    /// Removes the nodes of deleted sources without parsing anything.
    /// Surviving nodes that were bound against them stay unbound until the
    /// next [`compile`](Self::compile).
    pub fn unload(&mut self) -> Result<BatchReport, CompileError> {
        let changes = compute_change_set(&self.registry).removals_only();
        if changes.is_clean() {
            return Ok(BatchReport::default());
        }
        let (report, _) = self.run_batch(&changes, BatchMode::Unload)?;
        Ok(report)
    }

    /// Runs a full batch over the pending changes and rolls it back. The
    /// repository and registry are left untouched either way.
    pub fn check(&mut self) -> Result<BatchReport, CompileError> {
        let changes = compute_change_set(&self.registry);
        let (report, _) = self.run_batch(&changes, BatchMode::Check)?;
        Ok(report)
    }

    fn set_phase(&self, phase: BatchPhase) {
        let mut current = self.phase.lock();
        tracing::debug!(from = %*current, to = %phase, "batch phase");
        *current = phase;
    }

    fn run_batch(
        &mut self,
        changes: &ChangeSet,
        mode: BatchMode,
    ) -> Result<(BatchReport, SourceMutation), CompileError> {
        let span = tracing::info_span!("batch", ?mode, sources = changes.total());
        let _entered = span.enter();
        tracing::info!(
            new = changes.new.len(),
            modified = changes.modified.len(),
            removed = changes.removed.len(),
            pending = self.pending_rebind.len(),
            "batch started"
        );

        let repo = Arc::clone(&self.repository);
        let touched: Vec<String> = changes.all().into_iter().collect();
        let _source_guards = repo.locks().sources.write_all(touched.iter());

        repo.begin_with(mode != BatchMode::Check)?;
        let mutation = SourceMutation::new();

        let processed = match self.process(&repo, changes, mode, &mutation) {
            Ok(processed) => processed,
            Err(err) => return Err(self.abort(&repo, err)),
        };

        let mut report = BatchReport {
            compiled: processed.parsed.iter().map(|(s, _)| s.clone()).collect(),
            removed: processed.removed_sources.clone(),
            parsed_nodes: processed.parsed.iter().map(|(_, r)| r.len()).sum(),
            unbound_nodes: processed.unbound,
            rebound_dependents: processed.rebound,
            pruned_packages: processed.pruned,
            mutation: mutation.report(),
            ..BatchReport::default()
        };

        if mode == BatchMode::Check {
            repo.rollback()?;
            self.matcher.invalidate();
            self.set_phase(BatchPhase::Idle);
            tracing::info!("check finished, changes discarded");
            return Ok((report, mutation));
        }

        self.set_phase(BatchPhase::Committing);
        let summary = match repo.commit() {
            Ok(summary) => summary,
            Err(err) => return Err(self.abort(&repo, err.into())),
        };
        report.added = summary.added.len();
        report.modified = summary.modified.len();
        report.evicted = summary.evicted.len();

        for (source, roots) in processed.parsed {
            self.registry.mark_compiled(&source, roots)?;
        }
        for source in &processed.removed_sources {
            self.registry.purge(source)?;
        }
        match mode {
            BatchMode::Unload => self.pending_rebind.extend(processed.dependents),
            _ => self.pending_rebind.clear(),
        }

        self.matcher.invalidate();
        self.set_phase(BatchPhase::Idle);
        tracing::info!(
            compiled = report.compiled.len(),
            removed = report.removed.len(),
            pruned_packages = report.pruned_packages,
            added = report.added,
            evicted = report.evicted,
            "batch committed"
        );
        Ok((report, mutation))
    }

    /// Rolls the open transaction back and returns the error that caused it.
    fn abort(&self, repo: &NodeRepository, err: CompileError) -> CompileError {
        self.set_phase(BatchPhase::Failed);
        tracing::warn!(error = %err, "batch failed");
        self.set_phase(BatchPhase::RollingBack);
        if repo.current_transaction().is_some_and(|t| t.is_open()) {
            if let Err(rollback) = repo.rollback() {
                tracing::error!(error = %rollback, "rollback failed");
            }
        }
        self.matcher.invalidate();
        self.set_phase(BatchPhase::Idle);
        err
    }

    fn process(
        &self,
        repo: &NodeRepository,
        changes: &ChangeSet,
        mode: BatchMode,
        mutation: &SourceMutation,
    ) -> Result<Processed, CompileError> {
        let visited = VisitedSet::new();
        let scope = BatchScope::default();
        let ctx = ProcessContext::new(repo, &self.matcher, &visited, mutation, &scope);

        self.set_phase(BatchPhase::ComputingDelta);
        let stale = changes.needs_unbind();
        let exclusion = compute_exclusion(repo, &self.registry, &stale);

        self.set_phase(BatchPhase::UnbindingStale);
        for root in &exclusion.roots {
            ctx.full_dispatch(*root, Stage::UnbindWalk)?;
        }
        for node in &exclusion.removed {
            scope.collect_removed(*node);
        }
        let removed = scope.removed();
        for node in &removed {
            ctx.dispatch(*node, Stage::Unbind)?;
        }
        for dependent in &exclusion.dependents {
            scope.add_dependent(*dependent);
            ctx.dispatch(*dependent, Stage::Unbind)?;
            repo.remove_compile_state(
                *dependent,
                CompileState::PROCESSED | CompileState::VALIDATED,
            )?;
        }
        for node in &removed {
            mutation.mark_for_deletion(repo, *node)?;
        }
        tracing::debug!(
            removed = removed.len(),
            dependents = exclusion.dependents.len(),
            "stale nodes unbound"
        );

        let mut parsed = Vec::new();
        let mut targets: Vec<NodeId> = Vec::new();
        let mut rebound = 0;
        if mode != BatchMode::Unload {
            self.set_phase(BatchPhase::Parsing);
            for source in changes.needs_parse() {
                let text = self.registry.get_content(&source)?;
                let roots = self.parse_source(repo, &source, text)?;
                targets.extend(&roots);
                parsed.push((source, roots));
            }

            let rebind: IndexSet<NodeId> = scope
                .dependents()
                .iter()
                .chain(&self.pending_rebind)
                .copied()
                .filter(|n| repo.contains(*n) && !scope.is_removed(*n))
                .filter(|n| !repo.has_state(*n, CompileState::MARKED_FOR_DELETION))
                .collect();
            rebound = rebind.len();
            targets.extend(rebind);

            self.set_phase(BatchPhase::Binding);
            self.run_stage(&ctx, &targets, Stage::Bind)?;
            self.set_phase(BatchPhase::Validating);
            self.run_stage(&ctx, &targets, Stage::Validate)?;
            for node in &targets {
                repo.add_compile_state(*node, CompileState::PROCESSED | CompileState::VALIDATED)?;
            }
        }

        let pruned = processors::prune_empty_packages(&ctx, &scope.detached_from())?;

        if self.options.validate_repository {
            repo.validate()?;
        }

        Ok(Processed {
            parsed,
            removed_sources: changes.removed.iter().cloned().collect(),
            unbound: removed.len(),
            dependents: scope.dependents(),
            rebound,
            pruned: pruned.len(),
        })
    }

    /// Dispatches `stage` over `nodes`, on the rayon pool when
    /// `parallel_dispatch` is set. Bind must be handled by a real handler.
    fn run_stage(
        &self,
        ctx: &ProcessContext<'_>,
        nodes: &[NodeId],
        stage: Stage,
    ) -> Result<(), CompileError> {
        let run = |node: &NodeId| -> Result<(), CompileError> {
            match stage {
                Stage::Bind => ctx.full_dispatch(*node, stage),
                _ => ctx.dispatch(*node, stage).map(|_| ()),
            }
        };
        if self.options.parallel_dispatch {
            nodes.par_iter().try_for_each(run)
        } else {
            nodes.iter().try_for_each(run)
        }
    }

    fn parse_source(
        &self,
        repo: &NodeRepository,
        source: &str,
        text: &str,
    ) -> Result<Vec<NodeId>, CompileError> {
        let mut roots = Vec::new();
        for section in split_sections(text) {
            let Some(parser) = self.parsers.get(&section.parser) else {
                let header = section.first_line.saturating_sub(1).max(1);
                return Err(CompileError::compilation(
                    format!("no parser registered for section '{}'", section.parser),
                    Some(SourceInformation::new(source, header, 1, header, 1)),
                ));
            };
            let ctx = ParseContext::new(repo, source, section.first_line - 1);
            roots.extend(parser.parse(&ctx, &section.text)?);
        }
        tracing::debug!(source, roots = roots.len(), "source parsed");
        Ok(roots)
    }
}
