//! Graph construction.
//!
//! Traversal runs in breadth-first waves. Every node of a wave is read,
//! hashed and transformed in parallel on the rayon pool; the results are
//! then committed one by one, in queue order, on the calling thread. Only the
//! commit step touches the graph, so discovery order does not depend on
//! thread scheduling and no locking is needed.

use crate::error::ModuleError;
use crate::graph::{EdgeTarget, ImportEdge, ModuleGraph, ModuleId, ModuleOutput, ModuleState};
use crate::resolver::{Importer, ResolveError, ResolveReason, Resolved, Resolver};
use crate::transform::{Transform, TransformError, TransformOutput};
use rayon::prelude::*;
use relink_util::hash::ContentHash;
use rustc_hash::FxHashSet;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

/// What happened to a node processed in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Raw bytes matched the stored hash; nothing was recomputed.
    Unchanged,
    /// Transformed (successfully or not).
    Transformed,
    /// The file could not be read.
    Unreadable,
}

/// Per-pass bookkeeping.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Processed nodes and their outcomes, in commit order.
    pub processed: Vec<(ModuleId, Outcome)>,
    /// Nodes whose set of module targets changed.
    pub edges_changed: BTreeSet<ModuleId>,
    /// Nodes created during the pass.
    pub discovered: BTreeSet<ModuleId>,
}

impl PassReport {
    /// Nodes whose content was recomputed.
    pub fn content_changed(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.processed
            .iter()
            .filter(|(_, outcome)| *outcome != Outcome::Unchanged)
            .map(|(id, _)| *id)
    }

    /// Nodes that ran through the transform.
    pub fn transformed(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.processed
            .iter()
            .filter(|(_, outcome)| *outcome == Outcome::Transformed)
            .map(|(id, _)| *id)
    }
}

struct Job {
    id: ModuleId,
    path: PathBuf,
    name: String,
    previous: Option<ContentHash>,
    reusable: bool,
}

enum Loaded {
    Unchanged,
    Unreadable(String),
    Transformed {
        hash: ContentHash,
        result: Result<TransformOutput, TransformError>,
    },
}

/// Builds and updates a [`ModuleGraph`] with one resolver and transform.
pub struct GraphBuilder<'a> {
    resolver: &'a Resolver,
    transform: &'a dyn Transform,
}

impl<'a> GraphBuilder<'a> {
    #[must_use]
    pub fn new(resolver: &'a Resolver, transform: &'a dyn Transform) -> Self {
        Self {
            resolver,
            transform,
        }
    }

    /// Full build from the entry specifier.
    pub fn build(&self, entry: &str) -> Result<(ModuleGraph, PassReport), ResolveError> {
        let entry_path = match self.resolver.resolve(entry, Importer::Entry)? {
            Resolved::Module(path) => path,
            Resolved::External(_) => {
                return Err(ResolveError {
                    specifier: entry.to_string(),
                    importer: self.resolver.root().to_path_buf(),
                    reason: ResolveReason::NotFound,
                    tried: Vec::new(),
                })
            }
        };

        let mut graph = ModuleGraph::new(self.resolver.root());
        let (entry_id, _) = graph.insert_pending(entry_path);
        graph.set_entry(entry_id);

        let mut report = PassReport::default();
        report.discovered.insert(entry_id);
        self.process(&mut graph, vec![entry_id], &mut report);
        graph.renumber();
        Ok((graph, report))
    }

    /// Process `seeds` and then every node they newly discover, wave by wave.
    /// Already-known targets are reused as they are.
    pub fn process(&self, graph: &mut ModuleGraph, seeds: Vec<ModuleId>, report: &mut PassReport) {
        let mut visited: FxHashSet<ModuleId> = report.processed.iter().map(|(id, _)| *id).collect();
        let mut queue = seeds;

        while !queue.is_empty() {
            let jobs: Vec<Job> = queue
                .drain(..)
                .filter(|id| visited.insert(*id))
                .filter_map(|id| {
                    let node = graph.get_mut(id)?;
                    let reusable = node.state != ModuleState::Failed && node.output.is_some();
                    node.state = ModuleState::Transforming;
                    Some(Job {
                        id,
                        path: node.path.clone(),
                        name: node.name.clone(),
                        previous: node.hash,
                        reusable,
                    })
                })
                .collect();

            tracing::debug!(wave = jobs.len(), "transforming wave");

            let loaded: Vec<Loaded> = jobs.par_iter().map(|job| self.load(job)).collect();

            for (job, loaded) in jobs.iter().zip(loaded) {
                let outcome = match loaded {
                    Loaded::Unchanged => Outcome::Unchanged,
                    Loaded::Unreadable(_) => Outcome::Unreadable,
                    Loaded::Transformed { .. } => Outcome::Transformed,
                };
                let discovered = self.commit(graph, job.id, loaded, report);
                report.processed.push((job.id, outcome));
                report.discovered.extend(discovered.iter().copied());
                queue.extend(discovered);
            }
        }
    }

    /// Read, hash and transform one module. Runs on a worker thread and does
    /// not touch the graph.
    fn load(&self, job: &Job) -> Loaded {
        let raw = match std::fs::read(&job.path) {
            Ok(raw) => raw,
            Err(e) => return Loaded::Unreadable(e.to_string()),
        };
        let hash = ContentHash::of(&raw);
        if job.reusable && job.previous == Some(hash) {
            tracing::debug!(module = %job.name, "content unchanged");
            return Loaded::Unchanged;
        }

        tracing::debug!(module = %job.name, hash = %hash.short(), transform = self.transform.name(), "transforming");
        Loaded::Transformed {
            hash,
            result: self.transform.transform(&job.path, &job.name, &raw),
        }
    }

    /// Apply one load result to the graph. Returns nodes created for new edges.
    fn commit(
        &self,
        graph: &mut ModuleGraph,
        id: ModuleId,
        loaded: Loaded,
        report: &mut PassReport,
    ) -> Vec<ModuleId> {
        let Some(path) = graph.get(id).map(|n| n.path.clone()) else {
            return Vec::new();
        };

        match loaded {
            Loaded::Unchanged => {
                if let Some(node) = graph.get_mut(id) {
                    node.state = if node.error.is_some() {
                        ModuleState::Failed
                    } else {
                        ModuleState::Ready
                    };
                }
                Vec::new()
            }
            Loaded::Unreadable(message) => {
                if graph.set_imports(id, Vec::new()) {
                    report.edges_changed.insert(id);
                }
                if let Some(node) = graph.get_mut(id) {
                    node.hash = None;
                    node.output = None;
                    node.state = ModuleState::Failed;
                    node.error = Some(ModuleError::Read { path, message });
                }
                Vec::new()
            }
            Loaded::Transformed {
                hash,
                result: Ok(output),
            } => {
                let (edges, error, discovered) = self.resolve_edges(graph, id, &output.imports);
                if graph.set_imports(id, edges) {
                    report.edges_changed.insert(id);
                }
                if let Some(node) = graph.get_mut(id) {
                    node.hash = Some(hash);
                    node.output = Some(ModuleOutput {
                        code: Arc::from(output.code),
                        map: Arc::new(output.map),
                    });
                    node.state = if error.is_some() {
                        ModuleState::Failed
                    } else {
                        ModuleState::Ready
                    };
                    node.error = error.map(ModuleError::Resolve);
                }
                discovered
            }
            Loaded::Transformed {
                hash,
                result: Err(err),
            } => {
                tracing::debug!(module = %path.display(), error = %err, "transform failed");
                let (edges, _, discovered) = self.resolve_edges(graph, id, &err.partial_imports);
                if graph.set_imports(id, edges) {
                    report.edges_changed.insert(id);
                }
                if let Some(node) = graph.get_mut(id) {
                    node.hash = Some(hash);
                    node.output = None;
                    node.state = ModuleState::Failed;
                    node.error = Some(ModuleError::Transform(err));
                }
                discovered
            }
        }
    }

    /// Resolve `specifiers` from node `id`, inserting pending nodes for new
    /// targets. Returns the edges, the first resolution error and the new nodes.
    fn resolve_edges(
        &self,
        graph: &mut ModuleGraph,
        id: ModuleId,
        specifiers: &[String],
    ) -> (Vec<ImportEdge>, Option<ResolveError>, Vec<ModuleId>) {
        let Some(importer) = graph.get(id).map(|n| n.path.clone()) else {
            return (Vec::new(), None, Vec::new());
        };

        let mut edges = Vec::with_capacity(specifiers.len());
        let mut first_error = None;
        let mut discovered = Vec::new();

        for specifier in specifiers {
            let target = match self.resolver.resolve(specifier, Importer::Module(&importer)) {
                Ok(Resolved::Module(path)) => {
                    let (target, created) = graph.insert_pending(path);
                    if created {
                        discovered.push(target);
                    }
                    EdgeTarget::Module(target)
                }
                Ok(Resolved::External(_)) => EdgeTarget::External,
                Err(e) => {
                    tracing::debug!(specifier = %specifier, from = %importer.display(), reason = %e.reason, "unresolved import");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    EdgeTarget::Unresolved
                }
            };
            edges.push(ImportEdge {
                specifier: specifier.clone(),
                target,
            });
        }

        (edges, first_error, discovered)
    }

    /// Resolve a node's imports again without re-reading or re-transforming
    /// it. Newly discovered targets are processed as part of `report`.
    pub fn reresolve(&self, graph: &mut ModuleGraph, id: ModuleId, report: &mut PassReport) {
        let Some(node) = graph.get(id) else {
            return;
        };
        if matches!(node.error, Some(ModuleError::Read { .. })) {
            return;
        }
        let specifiers: Vec<String> = node.imports.iter().map(|e| e.specifier.clone()).collect();
        let transform_failed = node.output.is_none();

        let (edges, error, discovered) = self.resolve_edges(graph, id, &specifiers);
        if graph.set_imports(id, edges) {
            report.edges_changed.insert(id);
        }
        if !transform_failed {
            if let Some(node) = graph.get_mut(id) {
                node.state = if error.is_some() {
                    ModuleState::Failed
                } else {
                    ModuleState::Ready
                };
                node.error = error.map(ModuleError::Resolve);
            }
        }

        report.discovered.extend(discovered.iter().copied());
        self.process(graph, discovered, report);
    }
}
