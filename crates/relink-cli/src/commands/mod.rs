//! Command implementations.

pub mod build;
pub mod watch;

use relink_core::paths::{display_name, project_root};
use relink_core::{BuildError, BundleConfig, ConfigError, Diagnostic, LintMode};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Command-line values that override the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub entry: Option<String>,
    pub out_dir: Option<PathBuf>,
    pub lint_mode: Option<LintMode>,
    pub debounce_ms: Option<u64>,
}

/// Load the bundle config for `cwd`.
///
/// An explicit `config_path` wins; otherwise `relink.json` is looked up at the
/// project root containing `cwd`. Overrides are applied last.
pub fn load_config(
    cwd: &Path,
    config_path: Option<&Path>,
    overrides: &Overrides,
) -> Result<BundleConfig, ConfigError> {
    let mut config = match config_path {
        Some(path) if path.is_absolute() => BundleConfig::load(path)?,
        Some(path) => BundleConfig::load(&cwd.join(path))?,
        None => {
            let root = project_root(cwd).unwrap_or_else(|| cwd.to_path_buf());
            BundleConfig::discover(&root)?
        }
    };

    if let Some(entry) = &overrides.entry {
        config = config.with_entry(entry.clone());
    }
    if let Some(out_dir) = &overrides.out_dir {
        let out_dir = if out_dir.is_absolute() {
            out_dir.clone()
        } else {
            cwd.join(out_dir)
        };
        config = config.with_out_dir(out_dir);
    }
    if let Some(mode) = overrides.lint_mode {
        config = config.with_lint_mode(mode);
    }
    if let Some(ms) = overrides.debounce_ms {
        config = config.with_debounce_ms(ms);
    }
    config.validate()?;
    Ok(config)
}

/// Diagnostic as printed by `--json`, with the path made root-relative.
#[derive(Debug, Serialize)]
pub struct DiagnosticJson {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl DiagnosticJson {
    pub fn new(root: Option<&Path>, diag: &Diagnostic) -> Self {
        Self {
            code: diag.code.clone(),
            message: diag.message.clone(),
            path: diag.path.as_deref().map(|p| match root {
                Some(root) => display_name(root, p),
                None => p.display().to_string(),
            }),
        }
    }
}

pub fn diagnostics_json(root: Option<&Path>, err: &BuildError) -> Vec<DiagnosticJson> {
    err.diagnostics()
        .iter()
        .map(|d| DiagnosticJson::new(root, d))
        .collect()
}

/// Print a failed pass for humans on stderr.
pub fn print_failure(root: Option<&Path>, err: &BuildError) {
    eprintln!("error: {err}");
    print_diagnostics(root, &err.diagnostics());
}

pub fn print_diagnostics(root: Option<&Path>, diagnostics: &[Diagnostic]) {
    for diag in diagnostics.iter().map(|d| DiagnosticJson::new(root, d)) {
        match diag.path {
            Some(path) => eprintln!("  [{}] {path}: {}", diag.code, diag.message),
            None => eprintln!("  [{}] {}", diag.code, diag.message),
        }
    }
}

pub fn names(root: &Path, paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| display_name(root, p)).collect()
}

#[allow(clippy::cast_precision_loss)]
pub fn kilobytes(bytes: usize) -> f64 {
    bytes as f64 / 1024.0
}
