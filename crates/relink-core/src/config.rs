//! Bundle configuration.
//!
//! Loaded from `relink.json` at the project root. Every field is optional;
//! relative paths are interpreted against the directory holding the file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Config file name looked up in the working directory.
pub const CONFIG_FILE: &str = "relink.json";

/// How failures of a module affect the modules that import it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Unresolved edges out of a failed module are treated as absent.
    #[default]
    Absent,
    /// Every transitive importer of a failed module is marked failed too.
    Propagate,
}

/// Lint gate mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LintMode {
    /// Do not run the linter.
    Off,
    /// Log findings, never block the build.
    #[default]
    Warn,
    /// Any error-severity finding aborts the build.
    Strict,
}

/// Lint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LintConfig {
    pub mode: LintMode,
    /// Glob patterns, relative to the root, naming the files to lint.
    pub include: Vec<String>,
    /// External linter argv (`["eslint", "--format", "unix"]`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

impl Default for LintConfig {
    fn default() -> Self {
        Self {
            mode: LintMode::Warn,
            include: vec!["src/**".to_string()],
            command: None,
        }
    }
}

/// Configuration for one bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Project root; resolution never escapes it.
    pub root: PathBuf,
    /// Entry module, relative to `root`.
    pub entry: String,
    /// Artifact directory, relative to `root`.
    pub out_dir: PathBuf,
    /// Bundle file name. The source map is written next to it as `<out_file>.map`.
    pub out_file: String,
    /// Resolver extension search order.
    pub extensions: Vec<String>,
    /// Specifier prefixes left to the host `require`.
    pub external: Vec<String>,
    /// Identifier replacements applied by the define stage.
    pub define: BTreeMap<String, String>,
    /// Watch quiet period in milliseconds.
    pub debounce_ms: u64,
    pub failure_policy: FailurePolicy,
    pub lint: LintConfig,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            entry: "src/index.js".to_string(),
            out_dir: PathBuf::from("build"),
            out_file: "main.js".to_string(),
            extensions: vec![".jsx".to_string(), ".js".to_string(), ".json".to_string()],
            external: Vec::new(),
            define: BTreeMap::new(),
            debounce_ms: 100,
            failure_policy: FailurePolicy::default(),
            lint: LintConfig::default(),
        }
    }
}

/// Configuration loading error.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config at {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Project root {} is not accessible: {source}", .path.display())]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl BundleConfig {
    /// Config rooted at `root` with default settings.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Load a config file. A relative `root` is resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let base = path.parent().unwrap_or(Path::new("."));
        if config.root.is_relative() {
            config.root = base.join(&config.root);
        }
        config.validate()?;
        Ok(config)
    }

    /// Load `relink.json` from `cwd` if present, otherwise defaults rooted at `cwd`.
    pub fn discover(cwd: &Path) -> Result<Self, ConfigError> {
        let candidate = cwd.join(CONFIG_FILE);
        if candidate.is_file() {
            Self::load(&candidate)
        } else {
            let config = Self::new(cwd);
            config.validate()?;
            Ok(config)
        }
    }

    /// Reject settings the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entry.trim().is_empty() {
            return Err(ConfigError::Invalid("entry must not be empty".to_string()));
        }
        if self.out_file.is_empty() || self.out_file.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "out_file must be a plain file name, got {:?}",
                self.out_file
            )));
        }
        if self.extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "extensions must list at least one suffix".to_string(),
            ));
        }
        if let Some(bad) = self.extensions.iter().find(|e| !e.starts_with('.') || e.len() < 2) {
            return Err(ConfigError::Invalid(format!(
                "extension {bad:?} must start with '.'"
            )));
        }
        if let Some(command) = &self.lint.command {
            if command.is_empty() {
                return Err(ConfigError::Invalid("lint.command must not be empty".to_string()));
            }
        }
        Ok(())
    }

    /// Canonical project root.
    pub fn canonical_root(&self) -> Result<PathBuf, ConfigError> {
        dunce::canonicalize(&self.root).map_err(|source| ConfigError::Root {
            path: self.root.clone(),
            source,
        })
    }

    /// Absolute artifact directory.
    #[must_use]
    pub fn out_dir_path(&self) -> PathBuf {
        if self.out_dir.is_absolute() {
            self.out_dir.clone()
        } else {
            self.root.join(&self.out_dir)
        }
    }

    /// Source map file name (`main.js.map`).
    #[must_use]
    pub fn map_file(&self) -> String {
        format!("{}.map", self.out_file)
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Set the entry module.
    #[must_use]
    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = entry.into();
        self
    }

    /// Set the artifact directory.
    #[must_use]
    pub fn with_out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = out_dir.into();
        self
    }

    /// Set the failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the lint mode.
    #[must_use]
    pub fn with_lint_mode(mut self, mode: LintMode) -> Self {
        self.lint.mode = mode;
        self
    }

    /// Set the debounce window.
    #[must_use]
    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = BundleConfig::default();
        assert_eq!(config.entry, "src/index.js");
        assert_eq!(config.out_file, "main.js");
        assert_eq!(config.map_file(), "main.js.map");
        assert_eq!(config.extensions, vec![".jsx", ".js", ".json"]);
        assert_eq!(config.failure_policy, FailurePolicy::Absent);
        assert_eq!(config.lint.mode, LintMode::Warn);
        assert_eq!(config.debounce(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"{
                "entry": "example/scripts/Root.jsx",
                "out_dir": "example/build",
                "failure_policy": "propagate",
                "lint": { "mode": "strict" },
                "define": { "process.env.NODE_ENV": "\"development\"" }
            }"#,
        )
        .unwrap();

        let config = BundleConfig::load(&path).unwrap();
        assert_eq!(config.entry, "example/scripts/Root.jsx");
        assert_eq!(config.root, dir.path().join("."));
        assert_eq!(config.out_dir_path(), dir.path().join(".").join("example/build"));
        assert_eq!(config.failure_policy, FailurePolicy::Propagate);
        assert_eq!(config.lint.mode, LintMode::Strict);
        assert_eq!(config.lint.include, vec!["src/**"]);
        assert_eq!(
            config.define.get("process.env.NODE_ENV").map(String::as_str),
            Some("\"development\"")
        );
        assert_eq!(config.out_file, "main.js");
    }

    #[test]
    fn test_discover_without_file_uses_cwd() {
        let dir = tempdir().unwrap();
        let config = BundleConfig::discover(dir.path()).unwrap();
        assert_eq!(config.root, dir.path());
    }

    #[test]
    fn test_parse_error_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "{ not json").unwrap();

        let err = BundleConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(CONFIG_FILE));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = BundleConfig {
            out_file: "dist/main.js".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = BundleConfig {
            extensions: vec!["js".to_string()],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = BundleConfig::default().with_entry("  ");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
