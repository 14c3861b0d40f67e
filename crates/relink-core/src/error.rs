use crate::config::ConfigError;
use crate::lint::LintError;
use crate::resolver::ResolveError;
use crate::transform::TransformError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Structured error value surfaced to callers and watch listeners.
///
/// Every failure the engine reports can be flattened into a list of these:
/// a stable code, the offending module (when there is one) and a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// Stable SCREAMING_SNAKE error code.
    pub code: String,
    /// Offending module identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Human-readable message.
    pub message: String,
}

impl Diagnostic {
    #[must_use]
    pub fn new(code: impl Into<String>, path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            path,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {} ({})", self.code, self.message, path.display()),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

/// Why a single module node is `Failed`.
///
/// Captured on the node; never aborts traversal of independent subgraphs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("failed to read {}: {message}", .path.display())]
    Read { path: PathBuf, message: String },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("{} depends on failed module {}", .path.display(), .dependency.display())]
    DependencyFailed { path: PathBuf, dependency: PathBuf },
}

impl ModuleError {
    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Read { .. } => "MODULE_READ_ERROR",
            Self::Resolve(e) => e.reason.code(),
            Self::Transform(e) => e.code,
            Self::DependencyFailed { .. } => "DEPENDENCY_FAILED",
        }
    }

    /// Module the error is attributed to.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Read { path, .. } | Self::DependencyFailed { path, .. } => path,
            Self::Resolve(e) => &e.importer,
            Self::Transform(e) => &e.path,
        }
    }

    #[must_use]
    pub fn is_resolution(&self) -> bool {
        matches!(self, Self::Resolve(_))
    }

    #[must_use]
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::new(self.code(), Some(self.path().to_path_buf()), self.to_string())
    }
}

/// Linking failed; the previous good artifact (if any) stays in place.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("graph has no entry module")]
    NoEntry,

    #[error("{} required module(s) are not ready", .failures.len())]
    NotReady { failures: Vec<Diagnostic> },

    #[error("failed to serialize source map: {0}")]
    SourceMap(String),
}

impl LinkError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoEntry => "LINK_NO_ENTRY",
            Self::NotReady { .. } => "LINK_NOT_READY",
            Self::SourceMap(_) => "LINK_SOURCE_MAP",
        }
    }
}

/// Failure of one build or rebuild pass.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lint(#[from] LintError),

    #[error("cannot resolve entry module: {0}")]
    Entry(#[source] ResolveError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("failed to publish {}: {source}", .path.display())]
    Publish {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Lint(e) => e.code(),
            Self::Entry(_) => "ENTRY_NOT_FOUND",
            Self::Link(e) => e.code(),
            Self::Publish { .. } => "PUBLISH_ERROR",
        }
    }

    /// Flatten into structured diagnostics.
    ///
    /// A `NotReady` link failure expands to one diagnostic per failed module.
    #[must_use]
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            Self::Link(LinkError::NotReady { failures }) => failures.clone(),
            Self::Lint(LintError::Failed { findings, .. }) => findings
                .iter()
                .filter(|f| f.severity == crate::lint::Severity::Error)
                .map(crate::lint::LintFinding::to_diagnostic)
                .collect(),
            Self::Entry(e) => vec![Diagnostic::new(
                self.code(),
                Some(e.importer.clone()),
                e.to_string(),
            )],
            Self::Publish { path, .. } => {
                vec![Diagnostic::new(self.code(), Some(path.clone()), self.to_string())]
            }
            _ => vec![Diagnostic::new(self.code(), None, self.to_string())],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_display() {
        let diag = Diagnostic::new("LINK_NOT_READY", Some(PathBuf::from("/p/a.js")), "boom");
        assert_eq!(diag.to_string(), "LINK_NOT_READY: boom (/p/a.js)");

        let diag = Diagnostic::new("CONFIG_ERROR", None, "bad");
        assert_eq!(diag.to_string(), "CONFIG_ERROR: bad");
    }

    #[test]
    fn test_module_error_code_and_path() {
        let err = ModuleError::Read {
            path: PathBuf::from("/p/a.js"),
            message: "gone".to_string(),
        };
        assert_eq!(err.code(), "MODULE_READ_ERROR");
        assert_eq!(err.path(), Path::new("/p/a.js"));
        assert!(!err.is_resolution());
    }

    #[test]
    fn test_not_ready_expands_to_module_diagnostics() {
        let failures = vec![
            Diagnostic::new("TRANSFORM_SYNTAX_ERROR", Some(PathBuf::from("/p/b.js")), "x"),
            Diagnostic::new("RESOLVE_NOT_FOUND", Some(PathBuf::from("/p/c.js")), "y"),
        ];
        let err = BuildError::Link(LinkError::NotReady {
            failures: failures.clone(),
        });
        assert_eq!(err.code(), "LINK_NOT_READY");
        assert_eq!(err.diagnostics(), failures);
    }
}
