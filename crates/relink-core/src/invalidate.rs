//! Incremental invalidation.
//!
//! Given the files that changed since the last pass, recompute exactly the
//! nodes that depend on them and leave every other node, and its cached
//! output, untouched.

use crate::builder::{GraphBuilder, PassReport};
use crate::config::FailurePolicy;
use crate::error::ModuleError;
use crate::graph::{ModuleGraph, ModuleId, ModuleState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Kind of filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// Accumulated changes, keyed by canonical path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: BTreeMap<PathBuf, ChangeKind>,
}

impl ChangeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change. Later events for the same path override earlier
    /// ones, except that a file created and then modified stays `Created`.
    pub fn insert(&mut self, path: &Path, kind: ChangeKind) {
        self.insert_canonical(canonical_identity(path), kind);
    }

    /// [`ChangeSet::insert`] for a path that is already canonical. Never
    /// touches the filesystem.
    pub fn insert_canonical(&mut self, key: PathBuf, kind: ChangeKind) {
        let merged = match (self.changes.get(&key), kind) {
            (Some(ChangeKind::Created), ChangeKind::Modified) => ChangeKind::Created,
            (Some(ChangeKind::Deleted), ChangeKind::Created) => ChangeKind::Modified,
            _ => kind,
        };
        self.changes.insert(key, merged);
    }

    /// Fold another set into this one, in order.
    pub fn extend(&mut self, other: ChangeSet) {
        for (path, kind) in other.changes {
            self.insert_canonical(path, kind);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, ChangeKind)> {
        self.changes.iter().map(|(p, k)| (p.as_path(), *k))
    }

    #[must_use]
    pub fn get(&self, path: &Path) -> Option<ChangeKind> {
        self.changes.get(&canonical_identity(path)).copied()
    }

    #[must_use]
    pub fn has_kind(&self, kind: ChangeKind) -> bool {
        self.changes.values().any(|k| *k == kind)
    }
}

impl<P: AsRef<Path>> FromIterator<(P, ChangeKind)> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = (P, ChangeKind)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (path, kind) in iter {
            set.insert(path.as_ref(), kind);
        }
        set
    }
}

/// Canonical form of a possibly deleted path: canonicalize the file, or its
/// parent directory when the file no longer exists.
#[must_use]
pub fn canonical_identity(path: &Path) -> PathBuf {
    if let Ok(canonical) = dunce::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => dunce::canonicalize(parent)
            .map_or_else(|_| path.to_path_buf(), |dir| dir.join(name)),
        _ => path.to_path_buf(),
    }
}

/// Result of one invalidation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidation {
    /// Changed nodes and all their transitive importers, by discovery order.
    pub affected: Vec<PathBuf>,
    /// Nodes that ran through the transform.
    pub transformed: Vec<PathBuf>,
    /// Nodes removed because nothing reachable imports them anymore.
    pub pruned: Vec<PathBuf>,
}

/// Bring `graph` up to date with `changes`.
pub fn invalidate(
    graph: &mut ModuleGraph,
    builder: &GraphBuilder<'_>,
    changes: &ChangeSet,
    policy: FailurePolicy,
) -> Invalidation {
    let mut report = PassReport::default();

    let changed: Vec<ModuleId> = changes
        .iter()
        .filter_map(|(path, _)| graph.id_of(path))
        .collect();
    for id in &changed {
        if let Some(node) = graph.get_mut(*id) {
            node.state = ModuleState::Stale;
        }
    }
    builder.process(graph, changed.clone(), &mut report);

    let mut reresolve: BTreeSet<ModuleId> = BTreeSet::new();
    if changes.has_kind(ChangeKind::Deleted) {
        for (path, kind) in changes.iter() {
            if kind != ChangeKind::Deleted {
                continue;
            }
            if let Some(node) = graph.by_path(path) {
                reresolve.extend(node.importers.iter().copied());
            }
        }
    }
    // A created file may satisfy an unresolved import or shadow an existing
    // resolution (`b.jsx` ahead of `b.js`). Only moved targets count as affected.
    if changes.has_kind(ChangeKind::Created) {
        reresolve.extend(graph.ids());
    }
    for id in reresolve {
        if !changed.contains(&id) {
            builder.reresolve(graph, id, &mut report);
        }
    }

    apply_failure_policy(graph, policy);
    let pruned = graph.collect_orphans();
    graph.renumber();

    let seeds: BTreeSet<ModuleId> = report
        .content_changed()
        .chain(report.edges_changed.iter().copied())
        .chain(report.discovered.iter().copied())
        .collect();
    let affected = graph.importer_closure(seeds);

    Invalidation {
        affected: graph.paths_by_discovery(affected),
        transformed: graph.paths_by_discovery(report.transformed()),
        pruned,
    }
}

/// Reconcile propagated failures with the current graph.
///
/// Previously propagated `DependencyFailed` marks are cleared first. Under
/// [`FailurePolicy::Propagate`] every transitive importer of a failed node is
/// then marked failed again.
pub fn apply_failure_policy(graph: &mut ModuleGraph, policy: FailurePolicy) {
    for id in graph.ids() {
        if let Some(node) = graph.get_mut(id) {
            if matches!(node.error, Some(ModuleError::DependencyFailed { .. })) {
                node.error = None;
                node.state = ModuleState::Ready;
            }
        }
    }

    if policy != FailurePolicy::Propagate {
        return;
    }

    let failed: Vec<(ModuleId, PathBuf)> = graph
        .iter()
        .filter(|n| n.state == ModuleState::Failed)
        .map(|n| (n.id, n.path.clone()))
        .collect();

    for (failed_id, dependency) in failed {
        for id in graph.importer_closure([failed_id]) {
            if let Some(node) = graph.get_mut(id) {
                if node.state == ModuleState::Ready {
                    node.state = ModuleState::Failed;
                    node.error = Some(ModuleError::DependencyFailed {
                        path: node.path.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BundleConfig;
    use crate::resolver::Resolver;
    use crate::transform::TransformPipeline;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_change_set_merging() {
        let mut set = ChangeSet::new();
        set.insert(Path::new("/nonexistent/a.js"), ChangeKind::Created);
        set.insert(Path::new("/nonexistent/a.js"), ChangeKind::Modified);
        assert_eq!(set.get(Path::new("/nonexistent/a.js")), Some(ChangeKind::Created));

        set.insert(Path::new("/nonexistent/b.js"), ChangeKind::Deleted);
        set.insert(Path::new("/nonexistent/b.js"), ChangeKind::Created);
        assert_eq!(set.get(Path::new("/nonexistent/b.js")), Some(ChangeKind::Modified));

        set.insert(Path::new("/nonexistent/a.js"), ChangeKind::Deleted);
        assert_eq!(set.get(Path::new("/nonexistent/a.js")), Some(ChangeKind::Deleted));
        assert_eq!(set.len(), 2);
        assert!(set.has_kind(ChangeKind::Deleted));
        assert!(!set.has_kind(ChangeKind::Created));
    }

    #[test]
    fn test_deleted_path_keeps_canonical_parent() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("gone.js");
        let set: ChangeSet = [(&file, ChangeKind::Deleted)].into_iter().collect();
        let expected = dunce::canonicalize(dir.path()).unwrap().join("gone.js");
        assert_eq!(set.get(&expected), Some(ChangeKind::Deleted));
    }

    #[test]
    fn test_propagate_policy_marks_and_clears_importers() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("index.js"), "require('./a');").unwrap();
        fs::write(src.join("a.js"), "require('./b');").unwrap();
        fs::write(src.join("b.js"), "var s = 'broken;").unwrap();

        let resolver = Resolver::from_config(&BundleConfig::new(dir.path())).unwrap();
        let pipeline = TransformPipeline::new();
        let builder = GraphBuilder::new(&resolver, &pipeline);
        let (mut graph, _) = builder.build("src/index.js").unwrap();

        apply_failure_policy(&mut graph, FailurePolicy::Propagate);
        let entry = graph.get(graph.entry().unwrap()).unwrap();
        assert_eq!(entry.state, ModuleState::Failed);
        assert_eq!(entry.error.as_ref().unwrap().code(), "DEPENDENCY_FAILED");

        fs::write(src.join("b.js"), "module.exports = 1;").unwrap();
        let changes: ChangeSet = [(src.join("b.js"), ChangeKind::Modified)].into_iter().collect();
        let result = invalidate(&mut graph, &builder, &changes, FailurePolicy::Propagate);

        assert_eq!(graph.count_state(ModuleState::Ready), 3);
        assert_eq!(result.transformed.len(), 1);
        assert_eq!(result.affected.len(), 3);
    }

    #[test]
    fn test_absent_policy_leaves_importers_ready() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("index.js"), "require('./a');").unwrap();
        fs::write(src.join("a.js"), "var s = 'broken;").unwrap();

        let resolver = Resolver::from_config(&BundleConfig::new(dir.path())).unwrap();
        let pipeline = TransformPipeline::new();
        let builder = GraphBuilder::new(&resolver, &pipeline);
        let (mut graph, _) = builder.build("src/index.js").unwrap();

        apply_failure_policy(&mut graph, FailurePolicy::Absent);
        let entry = graph.get(graph.entry().unwrap()).unwrap();
        assert_eq!(entry.state, ModuleState::Ready);
        assert_eq!(graph.count_state(ModuleState::Failed), 1);
    }
}
