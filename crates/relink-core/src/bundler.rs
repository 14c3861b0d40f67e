//! Build driver.
//!
//! A [`Bundler`] owns everything one bundle needs across passes: the
//! resolver, the transform, the optional linter, the module graph and the
//! last artifact that linked. Full builds start from the entry; rebuilds feed
//! a change set through the invalidator and relink.

use crate::artifact::{ArtifactLocation, BuildArtifact};
use crate::builder::GraphBuilder;
use crate::config::{BundleConfig, LintMode};
use crate::error::BuildError;
use crate::graph::ModuleGraph;
use crate::invalidate::{apply_failure_policy, invalidate, ChangeSet};
use crate::link::link;
use crate::lint::{collect_sources, lint_gate, CommandLinter, LintError, Linter};
use crate::resolver::Resolver;
use crate::transform::{Transform, TransformPipeline};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Result of a pass that linked.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub artifact: Arc<BuildArtifact>,
    /// Modules whose output or edges may have changed, by discovery order.
    /// A full build reports every module.
    pub affected: Vec<PathBuf>,
    /// Modules that ran through the transform.
    pub transformed: Vec<PathBuf>,
    /// Modules dropped from the graph.
    pub pruned: Vec<PathBuf>,
}

pub struct Bundler {
    config: BundleConfig,
    resolver: Resolver,
    transform: Arc<dyn Transform>,
    linter: Option<Arc<dyn Linter>>,
    graph: Option<ModuleGraph>,
    last_good: Option<Arc<BuildArtifact>>,
}

impl std::fmt::Debug for Bundler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundler")
            .field("root", &self.resolver.root())
            .field("entry", &self.config.entry)
            .field("transform", &self.transform.name())
            .field("linter", &self.linter.as_ref().map(|l| l.name().to_string()))
            .field("modules", &self.graph.as_ref().map_or(0, ModuleGraph::len))
            .finish_non_exhaustive()
    }
}

impl Bundler {
    /// Validate `config` and set up the default transform pipeline. A linter
    /// is attached when `lint.command` is configured.
    pub fn new(config: BundleConfig) -> Result<Self, BuildError> {
        config.validate()?;
        let resolver = Resolver::from_config(&config)?;
        let transform: Arc<dyn Transform> = Arc::new(TransformPipeline::from_config(&config));
        let linter = config
            .lint
            .command
            .as_deref()
            .and_then(CommandLinter::new)
            .map(|l| Arc::new(l) as Arc<dyn Linter>);

        Ok(Self {
            config,
            resolver,
            transform,
            linter,
            graph: None,
            last_good: None,
        })
    }

    /// Replace the transform. Drops the graph, since cached outputs came from
    /// the old one.
    #[must_use]
    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = transform;
        self.graph = None;
        self
    }

    #[must_use]
    pub fn with_linter(mut self, linter: Arc<dyn Linter>) -> Self {
        self.linter = Some(linter);
        self
    }

    #[must_use]
    pub fn config(&self) -> &BundleConfig {
        &self.config
    }

    /// Canonical project root.
    #[must_use]
    pub fn root(&self) -> &std::path::Path {
        self.resolver.root()
    }

    /// Extension search order.
    #[must_use]
    pub fn extensions(&self) -> &[String] {
        self.resolver.extensions()
    }

    /// Module graph from the last pass, if one got past entry resolution.
    #[must_use]
    pub fn graph(&self) -> Option<&ModuleGraph> {
        self.graph.as_ref()
    }

    /// Last artifact that linked.
    #[must_use]
    pub fn last_good(&self) -> Option<&Arc<BuildArtifact>> {
        self.last_good.as_ref()
    }

    /// Lint, build the graph from the entry and link it.
    ///
    /// The graph is kept even when linking fails, so the next rebuild only
    /// has to fix what changed.
    pub fn full_build(&mut self) -> Result<BuildOutcome, BuildError> {
        let start = Instant::now();
        self.run_lint()?;

        let builder = GraphBuilder::new(&self.resolver, self.transform.as_ref());
        let (mut graph, report) = match builder.build(&self.config.entry) {
            Ok(built) => built,
            Err(e) => {
                self.graph = None;
                return Err(BuildError::Entry(e));
            }
        };
        apply_failure_policy(&mut graph, self.config.failure_policy);

        let affected = graph.paths_by_discovery(graph.ids());
        let transformed = graph.paths_by_discovery(report.transformed());
        let linked = link(&graph, &self.config.out_file);
        let modules = graph.len();
        self.graph = Some(graph);

        let artifact = Arc::new(linked?);
        self.last_good = Some(Arc::clone(&artifact));
        info!(
            modules,
            bytes = artifact.bytes().len(),
            hash = %artifact.hash().short(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "full build complete"
        );

        Ok(BuildOutcome {
            artifact,
            affected,
            transformed,
            pruned: Vec::new(),
        })
    }

    /// Bring the graph up to date with `changes` and relink. Falls back to a
    /// full build when there is no graph yet.
    pub fn rebuild(&mut self, changes: &ChangeSet) -> Result<BuildOutcome, BuildError> {
        let Some(graph) = self.graph.as_mut() else {
            debug!("no graph yet, running full build");
            return self.full_build();
        };
        let start = Instant::now();

        let builder = GraphBuilder::new(&self.resolver, self.transform.as_ref());
        let result = invalidate(graph, &builder, changes, self.config.failure_policy);
        let artifact = Arc::new(link(graph, &self.config.out_file)?);
        self.last_good = Some(Arc::clone(&artifact));

        info!(
            changes = changes.len(),
            affected = result.affected.len(),
            transformed = result.transformed.len(),
            pruned = result.pruned.len(),
            hash = %artifact.hash().short(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "rebuild complete"
        );

        Ok(BuildOutcome {
            artifact,
            affected: result.affected,
            transformed: result.transformed,
            pruned: result.pruned,
        })
    }

    /// Write `artifact` into the configured output directory.
    pub fn publish(&self, artifact: &BuildArtifact) -> Result<ArtifactLocation, BuildError> {
        let out_dir = self.config.out_dir_path();
        artifact
            .publish(&out_dir)
            .map_err(|source| BuildError::Publish {
                path: out_dir,
                source,
            })
    }

    fn run_lint(&self) -> Result<(), BuildError> {
        let mode = self.config.lint.mode;
        let Some(linter) = &self.linter else {
            if mode == LintMode::Strict {
                return Err(LintError::NotConfigured.into());
            }
            return Ok(());
        };
        if mode == LintMode::Off {
            return Ok(());
        }

        let paths = collect_sources(
            self.resolver.root(),
            &self.config.lint.include,
            self.resolver.extensions(),
        )?;
        lint_gate(linter.as_ref(), &paths, mode)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailurePolicy;
    use crate::invalidate::ChangeKind;
    use crate::lint::{LintFinding, LintReport};
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct Recording {
        seen: Mutex<Vec<PathBuf>>,
        findings: Vec<LintFinding>,
    }

    impl Linter for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn lint(&self, paths: &[PathBuf]) -> Result<LintReport, LintError> {
            self.seen.lock().unwrap().extend_from_slice(paths);
            Ok(LintReport {
                findings: self.findings.clone(),
            })
        }
    }

    fn project() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("index.js"), "require('./a');").unwrap();
        fs::write(src.join("a.js"), "module.exports = 'a';").unwrap();
        dir
    }

    #[test]
    fn test_full_build_then_noop_rebuild() {
        let dir = project();
        let mut bundler = Bundler::new(BundleConfig::new(dir.path())).unwrap();

        let first = bundler.full_build().unwrap();
        assert_eq!(first.affected.len(), 2);
        assert_eq!(first.transformed.len(), 2);

        let src = dunce::canonicalize(dir.path()).unwrap().join("src");
        let changes: ChangeSet = [(src.join("a.js"), ChangeKind::Modified)].into_iter().collect();
        let second = bundler.rebuild(&changes).unwrap();
        assert!(second.transformed.is_empty());
        assert_eq!(first.artifact.bytes(), second.artifact.bytes());
    }

    #[test]
    fn test_rebuild_without_graph_runs_full_build() {
        let dir = project();
        let mut bundler = Bundler::new(BundleConfig::new(dir.path())).unwrap();
        let outcome = bundler.rebuild(&ChangeSet::new()).unwrap();
        assert_eq!(outcome.transformed.len(), 2);
        assert!(bundler.graph().is_some());
    }

    #[test]
    fn test_missing_entry() {
        let dir = project();
        let config = BundleConfig::new(dir.path()).with_entry("src/nope.js");
        let mut bundler = Bundler::new(config).unwrap();
        let err = bundler.full_build().unwrap_err();
        assert_eq!(err.code(), "ENTRY_NOT_FOUND");
        assert!(bundler.graph().is_none());
    }

    #[test]
    fn test_link_failure_keeps_graph_and_last_good() {
        let dir = project();
        let mut bundler = Bundler::new(BundleConfig::new(dir.path())).unwrap();
        let good = bundler.full_build().unwrap();

        let src = dunce::canonicalize(dir.path()).unwrap().join("src");
        fs::write(src.join("a.js"), "var s = 'oops;").unwrap();
        let changes: ChangeSet = [(src.join("a.js"), ChangeKind::Modified)].into_iter().collect();
        let err = bundler.rebuild(&changes).unwrap_err();
        assert_eq!(err.code(), "LINK_NOT_READY");
        assert_eq!(err.diagnostics()[0].code, "TRANSFORM_SYNTAX_ERROR");

        assert!(bundler.graph().is_some());
        assert!(Arc::ptr_eq(bundler.last_good().unwrap(), &good.artifact));
    }

    #[test]
    fn test_warn_lint_runs_and_never_blocks() {
        let dir = project();
        let linter = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            findings: vec![LintFinding::error(dir.path().join("src/a.js"), "bad")],
        });
        let mut bundler = Bundler::new(BundleConfig::new(dir.path()))
            .unwrap()
            .with_linter(linter.clone());

        bundler.full_build().unwrap();
        assert_eq!(linter.seen.lock().unwrap().len(), 2);

        // Rebuilds do not lint.
        bundler.rebuild(&ChangeSet::new()).unwrap();
        assert_eq!(linter.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_strict_lint_aborts() {
        let dir = project();
        let linter = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            findings: vec![LintFinding::error(dir.path().join("src/a.js"), "bad")],
        });
        let config = BundleConfig::new(dir.path()).with_lint_mode(LintMode::Strict);
        let mut bundler = Bundler::new(config).unwrap().with_linter(linter);

        let err = bundler.full_build().unwrap_err();
        assert_eq!(err.code(), "LINT_FAILED");
        assert_eq!(err.diagnostics().len(), 1);
        assert!(bundler.graph().is_none());
    }

    #[test]
    fn test_strict_lint_without_linter_fails() {
        let dir = project();
        let config = BundleConfig::new(dir.path()).with_lint_mode(LintMode::Strict);
        let mut bundler = Bundler::new(config).unwrap();

        let err = bundler.full_build().unwrap_err();
        assert_eq!(err.code(), "LINT_NOT_CONFIGURED");
        assert!(bundler.graph().is_none());

        let config = BundleConfig::new(dir.path()).with_lint_mode(LintMode::Warn);
        assert!(Bundler::new(config).unwrap().full_build().is_ok());
    }

    #[test]
    fn test_propagate_policy_reports_dependency() {
        let dir = project();
        fs::write(dir.path().join("src/a.js"), "require('./missing');").unwrap();
        let config = BundleConfig::new(dir.path()).with_failure_policy(FailurePolicy::Propagate);
        let mut bundler = Bundler::new(config).unwrap();

        let err = bundler.full_build().unwrap_err();
        let codes: Vec<String> = err.diagnostics().into_iter().map(|d| d.code).collect();
        assert_eq!(codes, vec!["DEPENDENCY_FAILED", "RESOLVE_NOT_FOUND"]);
    }

    struct Banner;

    impl Transform for Banner {
        fn name(&self) -> &'static str {
            "banner"
        }

        fn transform(
            &self,
            path: &std::path::Path,
            source_name: &str,
            raw: &[u8],
        ) -> Result<crate::transform::TransformOutput, crate::transform::TransformError> {
            let inner = TransformPipeline::new().transform(path, source_name, raw)?;
            Ok(crate::transform::TransformOutput {
                code: format!("/* banner */ {}", inner.code),
                ..inner
            })
        }
    }

    #[test]
    fn test_custom_transform() {
        let dir = project();
        let mut bundler = Bundler::new(BundleConfig::new(dir.path()))
            .unwrap()
            .with_transform(Arc::new(Banner));
        let outcome = bundler.full_build().unwrap();
        assert!(outcome
            .artifact
            .code()
            .contains("/* banner */ module.exports = 'a';"));
    }

    #[test]
    fn test_publish() {
        let dir = project();
        let mut bundler = Bundler::new(BundleConfig::new(dir.path())).unwrap();
        let outcome = bundler.full_build().unwrap();
        let location = bundler.publish(&outcome.artifact).unwrap();
        assert_eq!(location.bundle, dir.path().join("build").join("main.js"));
        assert!(location.source_map.is_file());
    }
}
