//! Integration tests: full builds and incremental rebuilds through the
//! public `Bundler` API on scratch projects.

use relink_core::graph::ModuleState;
use relink_core::sourcemap::SourceMap;
use relink_core::{BundleConfig, Bundler, ChangeKind, ChangeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct Project {
    _dir: TempDir,
    root: PathBuf,
}

impl Project {
    fn new(files: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        let project = Self { _dir: dir, root };
        for (rel, content) in files {
            project.write(rel, content);
        }
        project
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn bundler(&self) -> Bundler {
        Bundler::new(BundleConfig::new(&self.root)).unwrap()
    }

    fn changes(&self, changes: &[(&str, ChangeKind)]) -> ChangeSet {
        changes
            .iter()
            .map(|(rel, kind)| (self.path(rel), *kind))
            .collect()
    }
}

fn rel(root: &Path, paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
        .collect()
}

#[test]
fn test_full_builds_are_byte_identical() {
    let project = Project::new(&[
        ("src/index.js", "var a = require('./a');\nvar b = require('./b');\n"),
        ("src/a.js", "module.exports = require('./shared');\n"),
        ("src/b.js", "module.exports = require('./shared') + 1;\n"),
        ("src/shared.js", "module.exports = 41;\n"),
    ]);

    let first = project.bundler().full_build().unwrap();
    let second = project.bundler().full_build().unwrap();
    assert_eq!(first.artifact.bytes(), second.artifact.bytes());
    assert_eq!(first.artifact.source_map(), second.artifact.source_map());
    assert_eq!(first.artifact.hash(), second.artifact.hash());
}

#[test]
fn test_leaf_edit_touches_only_the_leaf() {
    let project = Project::new(&[
        ("src/index.js", "require('./a');\nrequire('./c');\n"),
        ("src/a.js", "module.exports = 'a';\n"),
        ("src/c.js", "module.exports = 'c';\n"),
    ]);
    let mut bundler = project.bundler();
    bundler.full_build().unwrap();

    let graph = bundler.graph().unwrap();
    let before = Arc::clone(&graph.by_path(&project.path("src/c.js")).unwrap().output.as_ref().unwrap().code);

    project.write("src/a.js", "module.exports = 'A';\n");
    let outcome = bundler
        .rebuild(&project.changes(&[("src/a.js", ChangeKind::Modified)]))
        .unwrap();
    assert_eq!(rel(&project.root, &outcome.transformed), vec!["src/a.js"]);

    let graph = bundler.graph().unwrap();
    let after = &graph.by_path(&project.path("src/c.js")).unwrap().output.as_ref().unwrap().code;
    assert!(Arc::ptr_eq(&before, after));
    assert!(outcome.artifact.code().contains("module.exports = 'A';"));
}

#[test]
fn test_unimported_leaf_affects_only_itself() {
    let project = Project::new(&[
        ("src/index.js", "require('./a');\n"),
        ("src/a.js", "module.exports = 1;\n"),
    ]);
    let mut bundler = project.bundler();
    bundler.full_build().unwrap();

    // The entry has no importers of its own.
    project.write("src/index.js", "require('./a');\nconsole.log('hi');\n");
    let outcome = bundler
        .rebuild(&project.changes(&[("src/index.js", ChangeKind::Modified)]))
        .unwrap();
    assert_eq!(rel(&project.root, &outcome.affected), vec!["src/index.js"]);
    assert_eq!(rel(&project.root, &outcome.transformed), vec!["src/index.js"]);
}

#[test]
fn test_chain_edit_splices_new_output() {
    let project = Project::new(&[
        ("src/index.js", "require('./a');\n"),
        ("src/a.js", "module.exports = require('./b');\n"),
        ("src/b.js", "module.exports = 'old';\n"),
    ]);
    let mut bundler = project.bundler();
    let initial = bundler.full_build().unwrap();
    assert_eq!(
        rel(&project.root, initial.artifact.module_order()),
        vec!["src/index.js", "src/a.js", "src/b.js"]
    );
    assert_eq!(bundler.graph().unwrap().count_state(ModuleState::Ready), 3);

    project.write("src/b.js", "module.exports = 'new';\n");
    let outcome = bundler
        .rebuild(&project.changes(&[("src/b.js", ChangeKind::Modified)]))
        .unwrap();

    assert_eq!(
        rel(&project.root, &outcome.affected),
        vec!["src/index.js", "src/a.js", "src/b.js"]
    );
    assert_eq!(rel(&project.root, &outcome.transformed), vec!["src/b.js"]);
    assert_eq!(
        outcome.artifact.module_order(),
        initial.artifact.module_order()
    );
    let code = outcome.artifact.code();
    assert!(code.contains("module.exports = 'new';"));
    assert!(!code.contains("module.exports = 'old';"));
}

#[test]
fn test_dropped_edge_prunes_module() {
    let project = Project::new(&[
        ("src/index.js", "require('./a');\n"),
        ("src/a.js", "require('./b');\n"),
        ("src/b.js", "module.exports = 'b';\n"),
    ]);
    let mut bundler = project.bundler();
    bundler.full_build().unwrap();

    project.write("src/a.js", "module.exports = 'a';\n");
    let outcome = bundler
        .rebuild(&project.changes(&[("src/a.js", ChangeKind::Modified)]))
        .unwrap();

    assert_eq!(rel(&project.root, &outcome.pruned), vec!["src/b.js"]);
    assert_eq!(
        rel(&project.root, outcome.artifact.module_order()),
        vec!["src/index.js", "src/a.js"]
    );
    assert!(bundler.graph().unwrap().by_path(&project.path("src/b.js")).is_none());
}

#[test]
fn test_cycle_links_once_per_module() {
    let project = Project::new(&[
        ("src/index.js", "require('./a');\n"),
        ("src/a.js", "exports.b = require('./b');\n"),
        ("src/b.js", "exports.a = require('./a');\n"),
    ]);
    let outcome = project.bundler().full_build().unwrap();
    assert_eq!(
        rel(&project.root, outcome.artifact.module_order()),
        vec!["src/index.js", "src/a.js", "src/b.js"]
    );
    assert_eq!(outcome.artifact.code().matches("/* src/a.js */").count(), 1);
}

#[test]
fn test_transform_error_is_isolated() {
    let project = Project::new(&[
        ("src/index.js", "require('./a');\nrequire('./c');\n"),
        ("src/a.js", "require('./b');\n"),
        ("src/b.js", "var s = 'unterminated;\n"),
        ("src/c.js", "require('./d');\n"),
        ("src/d.js", "module.exports = 'd';\n"),
    ]);
    let mut bundler = project.bundler();
    let err = bundler.full_build().unwrap_err();
    let diagnostics = err.diagnostics();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].code, "TRANSFORM_SYNTAX_ERROR");
    assert_eq!(diagnostics[0].path.as_deref(), Some(project.path("src/b.js").as_path()));

    let graph = bundler.graph().unwrap();
    for ready in ["src/index.js", "src/a.js", "src/c.js", "src/d.js"] {
        assert_eq!(graph.by_path(&project.path(ready)).unwrap().state, ModuleState::Ready);
    }

    // Once nothing requires b, the artifact links again.
    project.write("src/index.js", "require('./c');\n");
    let outcome = bundler
        .rebuild(&project.changes(&[("src/index.js", ChangeKind::Modified)]))
        .unwrap();
    assert_eq!(
        rel(&project.root, &outcome.pruned),
        vec!["src/a.js", "src/b.js"]
    );
}

#[test]
fn test_incremental_matches_fresh_build() {
    let project = Project::new(&[
        ("src/index.js", "require('./a');\nrequire('./b');\n"),
        ("src/a.js", "module.exports = 'a';\n"),
        ("src/b.js", "module.exports = 'b';\n"),
    ]);
    let mut bundler = project.bundler();
    bundler.full_build().unwrap();

    project.write("src/index.js", "require('./b');\nrequire('./c');\nrequire('./a');\n");
    project.write("src/c.js", "module.exports = require('./b');\n");
    let incremental = bundler
        .rebuild(&project.changes(&[
            ("src/index.js", ChangeKind::Modified),
            ("src/c.js", ChangeKind::Created),
        ]))
        .unwrap();

    let fresh = project.bundler().full_build().unwrap();
    assert_eq!(incremental.artifact.bytes(), fresh.artifact.bytes());
    assert_eq!(incremental.artifact.source_map(), fresh.artifact.source_map());
}

#[test]
fn test_failed_rebuild_keeps_published_artifact() {
    let project = Project::new(&[
        ("src/index.js", "require('./a');\n"),
        ("src/a.js", "module.exports = 1;\n"),
    ]);
    let mut bundler = project.bundler();
    let good = bundler.full_build().unwrap();
    let location = bundler.publish(&good.artifact).unwrap();

    project.write("src/a.js", "module.exports = `oops;\n");
    let err = bundler
        .rebuild(&project.changes(&[("src/a.js", ChangeKind::Modified)]))
        .unwrap_err();
    assert_eq!(err.code(), "LINK_NOT_READY");

    assert_eq!(fs::read(&location.bundle).unwrap(), good.artifact.bytes());
    assert!(Arc::ptr_eq(bundler.last_good().unwrap(), &good.artifact));

    // Fixing the file recovers without a full build.
    project.write("src/a.js", "module.exports = 2;\n");
    let fixed = bundler
        .rebuild(&project.changes(&[("src/a.js", ChangeKind::Modified)]))
        .unwrap();
    assert_eq!(rel(&project.root, &fixed.transformed), vec!["src/a.js"]);
}

#[test]
fn test_deleted_and_recreated_dependency() {
    let project = Project::new(&[
        ("src/index.js", "require('./a');\n"),
        ("src/a.js", "module.exports = 1;\n"),
    ]);
    let mut bundler = project.bundler();
    bundler.full_build().unwrap();

    fs::remove_file(project.path("src/a.js")).unwrap();
    let err = bundler
        .rebuild(&project.changes(&[("src/a.js", ChangeKind::Deleted)]))
        .unwrap_err();
    let codes: Vec<String> = err.diagnostics().into_iter().map(|d| d.code).collect();
    assert_eq!(codes, vec!["RESOLVE_NOT_FOUND"]);
    assert!(bundler.graph().unwrap().by_path(&project.path("src/a.js")).is_none());

    project.write("src/a.js", "module.exports = 2;\n");
    let outcome = bundler
        .rebuild(&project.changes(&[("src/a.js", ChangeKind::Created)]))
        .unwrap();
    assert_eq!(
        rel(&project.root, outcome.artifact.module_order()),
        vec!["src/index.js", "src/a.js"]
    );
}

#[test]
fn test_created_file_shadows_existing_resolution() {
    let project = Project::new(&[
        ("src/index.js", "require('./b');\nrequire('./c');\n"),
        ("src/b.js", "module.exports = 'js';\n"),
        ("src/c.js", "module.exports = 'c';\n"),
    ]);
    let mut bundler = project.bundler();
    bundler.full_build().unwrap();

    // `.jsx` precedes `.js` in the search order.
    project.write("src/b.jsx", "module.exports = 'jsx';\n");
    let outcome = bundler
        .rebuild(&project.changes(&[("src/b.jsx", ChangeKind::Created)]))
        .unwrap();
    let fresh = project.bundler().full_build().unwrap();

    assert_eq!(
        rel(&project.root, outcome.artifact.module_order()),
        vec!["src/index.js", "src/b.jsx", "src/c.js"]
    );
    assert_eq!(outcome.artifact.bytes(), fresh.artifact.bytes());
    assert_eq!(rel(&project.root, &outcome.pruned), vec!["src/b.js"]);
    assert_eq!(
        rel(&project.root, &outcome.affected),
        vec!["src/index.js", "src/b.jsx"]
    );
    assert_eq!(rel(&project.root, &outcome.transformed), vec!["src/b.jsx"]);
}

#[test]
fn test_source_map_points_into_modules() {
    let project = Project::new(&[
        ("src/index.js", "require('./a');\n"),
        ("src/a.js", "var x = 1;\nthrow new Error('here');\n"),
    ]);
    let outcome = project.bundler().full_build().unwrap();
    let map = SourceMap::from_json(outcome.artifact.source_map()).unwrap();
    assert_eq!(map.sources, vec!["src/index.js", "src/a.js"]);

    let line = outcome
        .artifact
        .code()
        .split('\n')
        .position(|l| l == "throw new Error('here');")
        .unwrap();
    let hit = map.lookup(u32::try_from(line).unwrap(), 0).unwrap();
    assert_eq!((hit.source, hit.original_line), (1, 1));
}
