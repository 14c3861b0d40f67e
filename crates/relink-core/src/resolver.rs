//! Import specifier resolution.
//!
//! Maps a specifier plus the module that references it to a canonical file
//! identity under the project root.
//!
//! ## Specifier Types
//!
//! - Relative: `./utils`, `../lib/foo`
//! - Absolute: `/abs/path/to/module`
//! - Bare: `lodash`, `@scope/pkg`, `react/lib/React`
//!
//! Resolution is a pure function of its inputs and the filesystem; nothing is
//! cached, so a file created between two passes is picked up by the next one.

use crate::config::BundleConfig;
use crate::config::ConfigError;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The module a specifier is resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Importer<'a> {
    /// The entry marker; specifiers are taken relative to the project root.
    Entry,
    /// A known module identity.
    Module(&'a Path),
}

/// Result of resolving a specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// A canonical file under the project root.
    Module(PathBuf),
    /// Left to the host `require` at runtime.
    External(String),
}

/// Why a resolution failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveReason {
    EmptySpecifier,
    NotFound,
    RootEscape(PathBuf),
    PackageNotFound(String),
    InvalidPackageJson { path: PathBuf, message: String },
}

impl ResolveReason {
    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptySpecifier => "RESOLVE_EMPTY_SPECIFIER",
            Self::NotFound => "RESOLVE_NOT_FOUND",
            Self::RootEscape(_) => "RESOLVE_ROOT_ESCAPE",
            Self::PackageNotFound(_) => "RESOLVE_PACKAGE_NOT_FOUND",
            Self::InvalidPackageJson { .. } => "RESOLVE_INVALID_PACKAGE_JSON",
        }
    }
}

impl fmt::Display for ResolveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySpecifier => f.write_str("specifier is empty"),
            Self::NotFound => f.write_str("no file matches"),
            Self::RootEscape(path) => {
                write!(f, "{} is outside the project root", path.display())
            }
            Self::PackageNotFound(name) => write!(f, "cannot find package '{name}' in node_modules"),
            Self::InvalidPackageJson { path, message } => {
                write!(f, "invalid {}: {message}", path.display())
            }
        }
    }
}

/// Unresolvable import.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot resolve '{specifier}' from {}: {reason}", .importer.display())]
pub struct ResolveError {
    pub specifier: String,
    /// Importing module, or the project root for the entry marker.
    pub importer: PathBuf,
    pub reason: ResolveReason,
    /// Candidate paths checked, in order.
    pub tried: Vec<PathBuf>,
}

/// Import resolver bound to one project root.
#[derive(Debug, Clone)]
pub struct Resolver {
    root: PathBuf,
    extensions: Vec<String>,
    external: Vec<String>,
}

impl Resolver {
    /// Create a resolver. `root` must already be canonical.
    #[must_use]
    pub fn new(root: PathBuf, extensions: Vec<String>, external: Vec<String>) -> Self {
        Self {
            root,
            extensions,
            external,
        }
    }

    /// Build from a config, canonicalizing its root.
    pub fn from_config(config: &BundleConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.canonical_root()?,
            config.extensions.clone(),
            config.external.clone(),
        ))
    }

    /// Canonical project root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Extension search order.
    #[must_use]
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Resolve `specifier` as seen from `importer`.
    pub fn resolve(&self, specifier: &str, importer: Importer<'_>) -> Result<Resolved, ResolveError> {
        let mut tried = Vec::new();
        self.resolve_inner(specifier, importer, &mut tried)
            .map_err(|reason| ResolveError {
                specifier: specifier.to_string(),
                importer: match importer {
                    Importer::Entry => self.root.clone(),
                    Importer::Module(path) => path.to_path_buf(),
                },
                reason,
                tried,
            })
    }

    fn resolve_inner(
        &self,
        specifier: &str,
        importer: Importer<'_>,
        tried: &mut Vec<PathBuf>,
    ) -> Result<Resolved, ResolveReason> {
        if specifier.trim().is_empty() {
            return Err(ResolveReason::EmptySpecifier);
        }

        if self.is_external(specifier) {
            return Ok(Resolved::External(specifier.to_string()));
        }

        let base_dir = match importer {
            Importer::Entry => self.root.as_path(),
            Importer::Module(path) => path.parent().unwrap_or(self.root.as_path()),
        };

        let found = if specifier.starts_with('/') {
            self.resolve_path(Path::new(specifier), tried)
        } else if is_relative(specifier) || importer == Importer::Entry {
            self.resolve_path(&base_dir.join(specifier), tried)
        } else {
            self.resolve_bare(specifier, base_dir, tried)?
        };

        match found {
            Some(path) => self.within_root(&path).map(Resolved::Module),
            None => Err(ResolveReason::NotFound),
        }
    }

    fn is_external(&self, specifier: &str) -> bool {
        self.external.iter().any(|prefix| {
            specifier == prefix
                || specifier
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Canonicalize and reject anything outside the root.
    fn within_root(&self, path: &Path) -> Result<PathBuf, ResolveReason> {
        let canonical = dunce::canonicalize(path).map_err(|_| ResolveReason::NotFound)?;
        if canonical.starts_with(&self.root) {
            Ok(canonical)
        } else {
            Err(ResolveReason::RootEscape(canonical))
        }
    }

    /// Try `target`, `target<ext>` and `target/index<ext>` in that order.
    fn resolve_path(&self, target: &Path, tried: &mut Vec<PathBuf>) -> Option<PathBuf> {
        tried.push(target.to_path_buf());
        if target.is_file() {
            return Some(target.to_path_buf());
        }

        for ext in &self.extensions {
            let mut name = OsString::from(target.as_os_str());
            name.push(ext);
            let candidate = PathBuf::from(name);
            tried.push(candidate.clone());
            if candidate.is_file() {
                return Some(candidate);
            }
        }

        if target.is_dir() {
            for ext in &self.extensions {
                let candidate = target.join(format!("index{ext}"));
                tried.push(candidate.clone());
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }

        None
    }

    /// Walk `node_modules` directories from `from_dir` up to the root.
    fn resolve_bare(
        &self,
        specifier: &str,
        from_dir: &Path,
        tried: &mut Vec<PathBuf>,
    ) -> Result<Option<PathBuf>, ResolveReason> {
        let (pkg_name, subpath) = parse_bare_specifier(specifier);

        let mut current = Some(from_dir);
        while let Some(dir) = current {
            let pkg_dir = dir.join("node_modules").join(pkg_name);
            if pkg_dir.is_dir() {
                return match subpath {
                    Some(sub) => Ok(self.resolve_path(&pkg_dir.join(sub), tried)),
                    None => self.resolve_package_entry(&pkg_dir, tried),
                };
            }

            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            current = dir.parent();
        }

        Err(ResolveReason::PackageNotFound(pkg_name.to_string()))
    }

    /// Package entry: `browser` (string form), then `main`, then `index`.
    fn resolve_package_entry(
        &self,
        pkg_dir: &Path,
        tried: &mut Vec<PathBuf>,
    ) -> Result<Option<PathBuf>, ResolveReason> {
        let pkg_json = pkg_dir.join("package.json");
        if pkg_json.is_file() {
            let invalid = |message: String| ResolveReason::InvalidPackageJson {
                path: pkg_json.clone(),
                message,
            };
            let content = std::fs::read_to_string(&pkg_json).map_err(|e| invalid(e.to_string()))?;
            let json: serde_json::Value =
                serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;

            for field in ["browser", "main"] {
                if let Some(entry) = json.get(field).and_then(serde_json::Value::as_str) {
                    if let Some(found) = self.resolve_path(&pkg_dir.join(entry), tried) {
                        return Ok(Some(found));
                    }
                }
            }
        }

        Ok(self.resolve_path(&pkg_dir.join("index"), tried))
    }
}

fn is_relative(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
}

/// Split a bare specifier into package name and subpath.
fn parse_bare_specifier(specifier: &str) -> (&str, Option<&str>) {
    let split_at = if specifier.starts_with('@') {
        specifier
            .match_indices('/')
            .nth(1)
            .map(|(i, _)| i)
    } else {
        specifier.find('/')
    };

    match split_at {
        Some(i) if i + 1 < specifier.len() => (&specifier[..i], Some(&specifier[i + 1..])),
        Some(i) => (&specifier[..i], None),
        None => (specifier, None),
    }
}
