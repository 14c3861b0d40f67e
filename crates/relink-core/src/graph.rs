//! Module dependency graph.
//!
//! Arena storage: nodes live in a `Vec` indexed by [`ModuleId`], with a
//! path -> id map for deduplication. Edges are ids, so import cycles need no
//! shared ownership. Removed slots are left empty and never reused within a
//! graph's lifetime, which keeps ids stable across rebuilds.

use crate::error::ModuleError;
use crate::paths::display_name;
use crate::sourcemap::SourceMap;
use relink_util::hash::ContentHash;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Stable identifier of a node within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(u32);

impl ModuleId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Pending,
    Transforming,
    Ready,
    Stale,
    Failed,
}

impl ModuleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Transforming => "transforming",
            Self::Ready => "ready",
            Self::Stale => "stale",
            Self::Failed => "failed",
        }
    }
}

/// Transformed code and its per-module map. Shared so unchanged nodes are
/// reused across rebuilds without copying.
#[derive(Debug, Clone)]
pub struct ModuleOutput {
    pub code: Arc<str>,
    pub map: Arc<SourceMap>,
}

/// Where an import edge points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeTarget {
    Module(ModuleId),
    /// Left to the host `require`.
    External,
    /// Resolution failed; treated as absent.
    Unresolved,
}

/// One import of a node, in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEdge {
    pub specifier: String,
    pub target: EdgeTarget,
}

#[derive(Debug, Clone)]
pub struct ModuleNode {
    pub id: ModuleId,
    /// Canonical identity.
    pub path: PathBuf,
    /// Root-relative name.
    pub name: String,
    /// Hash of the raw bytes at the last successful read.
    pub hash: Option<ContentHash>,
    pub output: Option<ModuleOutput>,
    pub imports: Vec<ImportEdge>,
    pub importers: BTreeSet<ModuleId>,
    pub state: ModuleState,
    /// Position in first-discovery order of the last traversal.
    pub discovery: u32,
    pub error: Option<ModuleError>,
}

impl ModuleNode {
    /// Distinct module targets, in import order.
    pub fn dependencies(&self) -> impl Iterator<Item = ModuleId> + '_ {
        let mut seen = FxHashSet::default();
        self.imports.iter().filter_map(move |edge| match edge.target {
            EdgeTarget::Module(id) if seen.insert(id) => Some(id),
            _ => None,
        })
    }
}

/// The dependency graph of one entry.
#[derive(Debug, Clone)]
pub struct ModuleGraph {
    root: PathBuf,
    nodes: Vec<Option<ModuleNode>>,
    by_path: FxHashMap<PathBuf, ModuleId>,
    entry: Option<ModuleId>,
}

impl ModuleGraph {
    /// Create an empty graph for the project at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            nodes: Vec::new(),
            by_path: FxHashMap::default(),
            entry: None,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn entry(&self) -> Option<ModuleId> {
        self.entry
    }

    pub fn set_entry(&mut self, id: ModuleId) {
        self.entry = Some(id);
    }

    #[must_use]
    pub fn id_of(&self, path: &Path) -> Option<ModuleId> {
        self.by_path.get(path).copied()
    }

    #[must_use]
    pub fn get(&self, id: ModuleId) -> Option<&ModuleNode> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ModuleId) -> Option<&mut ModuleNode> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    #[must_use]
    pub fn by_path(&self, path: &Path) -> Option<&ModuleNode> {
        self.id_of(path).and_then(|id| self.get(id))
    }

    /// Number of live nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    /// Live nodes in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleNode> {
        self.nodes.iter().filter_map(Option::as_ref)
    }

    /// Live ids in id order.
    #[must_use]
    pub fn ids(&self) -> Vec<ModuleId> {
        self.iter().map(|n| n.id).collect()
    }

    /// Return the node for `path`, inserting a `Pending` one if absent.
    /// The flag is `true` when a node was created.
    pub fn insert_pending(&mut self, path: PathBuf) -> (ModuleId, bool) {
        if let Some(id) = self.id_of(&path) {
            return (id, false);
        }
        let id = ModuleId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        let name = display_name(&self.root, &path);
        self.by_path.insert(path.clone(), id);
        self.nodes.push(Some(ModuleNode {
            id,
            path,
            name,
            hash: None,
            output: None,
            imports: Vec::new(),
            importers: BTreeSet::new(),
            state: ModuleState::Pending,
            discovery: u32::MAX,
            error: None,
        }));
        (id, true)
    }

    /// Replace a node's import list, keeping `importers` of old and new
    /// targets in sync. Returns `true` if the set of module targets changed.
    pub fn set_imports(&mut self, id: ModuleId, imports: Vec<ImportEdge>) -> bool {
        let Some(node) = self.get_mut(id) else {
            return false;
        };
        let old: BTreeSet<ModuleId> = node.dependencies().collect();
        node.imports = imports;
        let new: BTreeSet<ModuleId> = node.dependencies().collect();

        for removed in old.difference(&new) {
            if let Some(target) = self.get_mut(*removed) {
                target.importers.remove(&id);
            }
        }
        for added in new.difference(&old) {
            if let Some(target) = self.get_mut(*added) {
                target.importers.insert(id);
            }
        }
        old != new
    }

    /// Remove a node and every edge touching it.
    pub fn remove(&mut self, id: ModuleId) -> Option<ModuleNode> {
        let node = self.nodes.get_mut(id.index())?.take()?;
        self.by_path.remove(&node.path);
        for dep in node.dependencies() {
            if let Some(target) = self.get_mut(dep) {
                target.importers.remove(&id);
            }
        }
        for importer in &node.importers {
            if let Some(source) = self.get_mut(*importer) {
                for edge in &mut source.imports {
                    if edge.target == EdgeTarget::Module(id) {
                        edge.target = EdgeTarget::Unresolved;
                    }
                }
            }
        }
        if self.entry == Some(id) {
            self.entry = None;
        }
        Some(node)
    }

    /// Nodes reachable from the entry over resolved edges, in breadth-first
    /// discovery order (imports visited in source order).
    #[must_use]
    pub fn reachable(&self) -> Vec<ModuleId> {
        let Some(entry) = self.entry.filter(|id| self.get(*id).is_some()) else {
            return Vec::new();
        };
        let mut order = vec![entry];
        let mut seen = FxHashSet::default();
        seen.insert(entry);
        let mut queue = VecDeque::from([entry]);

        while let Some(id) = queue.pop_front() {
            let Some(node) = self.get(id) else { continue };
            for dep in node.dependencies() {
                if self.get(dep).is_some() && seen.insert(dep) {
                    order.push(dep);
                    queue.push_back(dep);
                }
            }
        }
        order
    }

    /// Recompute discovery indices from a fresh traversal.
    pub fn renumber(&mut self) {
        for (index, id) in self.reachable().into_iter().enumerate() {
            if let Some(node) = self.get_mut(id) {
                node.discovery = u32::try_from(index).unwrap_or(u32::MAX);
            }
        }
    }

    /// Remove every node not reachable from the entry, including orphaned
    /// cycles. Returns the removed paths in id order.
    pub fn collect_orphans(&mut self) -> Vec<PathBuf> {
        let live: FxHashSet<ModuleId> = self.reachable().into_iter().collect();
        let orphans: Vec<ModuleId> = self.ids().into_iter().filter(|id| !live.contains(id)).collect();
        orphans
            .into_iter()
            .filter_map(|id| self.remove(id).map(|node| node.path))
            .collect()
    }

    /// `seeds` plus every node that imports one of them, directly or
    /// transitively.
    #[must_use]
    pub fn importer_closure(&self, seeds: impl IntoIterator<Item = ModuleId>) -> BTreeSet<ModuleId> {
        let mut closure = BTreeSet::new();
        let mut queue: VecDeque<ModuleId> = seeds
            .into_iter()
            .filter(|id| self.get(*id).is_some())
            .collect();

        while let Some(id) = queue.pop_front() {
            if !closure.insert(id) {
                continue;
            }
            if let Some(node) = self.get(id) {
                queue.extend(node.importers.iter().copied());
            }
        }
        closure
    }

    /// Paths of `ids`, ordered by discovery.
    #[must_use]
    pub fn paths_by_discovery(&self, ids: impl IntoIterator<Item = ModuleId>) -> Vec<PathBuf> {
        let mut nodes: Vec<&ModuleNode> = ids.into_iter().filter_map(|id| self.get(id)).collect();
        nodes.sort_by_key(|n| (n.discovery, n.id));
        nodes.into_iter().map(|n| n.path.clone()).collect()
    }

    /// Live nodes in `state`.
    #[must_use]
    pub fn count_state(&self, state: ModuleState) -> usize {
        self.iter().filter(|n| n.state == state).count()
    }
}
