//! Lint gate.
//!
//! The linter itself is an external collaborator behind the [`Linter`]
//! trait. The gate runs it over the configured sources before a full build:
//! in `warn` mode findings are only logged, in `strict` mode any error
//! finding aborts the build before the graph is touched.

use crate::config::LintMode;
use crate::error::Diagnostic;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Finding severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// One linter finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LintFinding {
    pub path: PathBuf,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub severity: Severity,
}

impl LintFinding {
    #[must_use]
    pub fn error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            line: None,
            column: None,
            message: message.into(),
            rule: None,
            severity: Severity::Error,
        }
    }

    #[must_use]
    pub fn warning(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(path, message)
        }
    }

    #[must_use]
    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    #[must_use]
    pub fn to_diagnostic(&self) -> Diagnostic {
        let code = match self.severity {
            Severity::Error => "LINT_ERROR",
            Severity::Warning => "LINT_WARNING",
        };
        let mut message = match (self.line, self.column) {
            (Some(line), Some(column)) => format!("{line}:{column} {}", self.message),
            _ => self.message.clone(),
        };
        if let Some(rule) = &self.rule {
            message.push_str(&format!(" ({rule})"));
        }
        Diagnostic::new(code, Some(self.path.clone()), message)
    }
}

/// Linter result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LintReport {
    pub findings: Vec<LintFinding>,
}

impl LintReport {
    /// No error-severity findings.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.error_count() == 0
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .count()
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.findings.len() - self.error_count()
    }
}

#[derive(Error, Debug)]
pub enum LintError {
    #[error("lint failed with {errors} error(s)")]
    Failed {
        errors: usize,
        findings: Vec<LintFinding>,
    },

    #[error("failed to run linter `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("linter `{command}` exited with {status}: {stderr}")]
    Crashed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("invalid lint pattern `{pattern}`: {message}")]
    Pattern { pattern: String, message: String },

    #[error("strict lint requested but no linter is configured (set lint.command)")]
    NotConfigured,
}

impl LintError {
    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Failed { .. } => "LINT_FAILED",
            Self::Spawn { .. } => "LINT_SPAWN_ERROR",
            Self::Crashed { .. } => "LINT_COMMAND_FAILED",
            Self::Pattern { .. } => "LINT_PATTERN_ERROR",
            Self::NotConfigured => "LINT_NOT_CONFIGURED",
        }
    }
}

/// External linter collaborator.
pub trait Linter: Send + Sync {
    fn name(&self) -> &str;

    /// Lint `paths`. Findings of any severity are not an `Err`.
    fn lint(&self, paths: &[PathBuf]) -> Result<LintReport, LintError>;
}

/// Expand root-relative glob patterns into the sorted, deduplicated set of
/// files whose extension is one of `extensions`.
pub fn collect_sources(
    root: &Path,
    patterns: &[String],
    extensions: &[String],
) -> Result<Vec<PathBuf>, LintError> {
    let mut files = Vec::new();
    for pattern in patterns {
        let full = root.join(pattern);
        let full = full.to_string_lossy();
        let entries = glob::glob(&full).map_err(|e| LintError::Pattern {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;
        for entry in entries.flatten() {
            let matches_ext = entry
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| extensions.iter().any(|ext| name.ends_with(ext.as_str())));
            if entry.is_file() && matches_ext {
                files.push(entry);
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// Run `linter` over `paths` according to `mode`.
pub fn lint_gate(
    linter: &dyn Linter,
    paths: &[PathBuf],
    mode: LintMode,
) -> Result<LintReport, LintError> {
    if mode == LintMode::Off {
        return Ok(LintReport::default());
    }

    let report = linter.lint(paths)?;
    for finding in &report.findings {
        let diag = finding.to_diagnostic();
        match finding.severity {
            Severity::Error => tracing::warn!(code = %diag.code, path = %finding.path.display(), "{}", diag.message),
            Severity::Warning => tracing::info!(code = %diag.code, path = %finding.path.display(), "{}", diag.message),
        }
    }
    tracing::info!(
        linter = linter.name(),
        files = paths.len(),
        errors = report.error_count(),
        warnings = report.warning_count(),
        "lint finished"
    );

    if mode == LintMode::Strict && !report.passed() {
        return Err(LintError::Failed {
            errors: report.error_count(),
            findings: report.findings,
        });
    }
    Ok(report)
}

/// Runs an external linter process that prints findings in the "unix"
/// format: `path:line:column: message [Severity/rule]`.
#[derive(Debug, Clone)]
pub struct CommandLinter {
    program: String,
    args: Vec<String>,
}

impl CommandLinter {
    /// `argv[0]` is the program, the rest are leading arguments; file paths
    /// are appended. Returns `None` for an empty argv.
    #[must_use]
    pub fn new(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Linter for CommandLinter {
    fn name(&self) -> &str {
        &self.program
    }

    fn lint(&self, paths: &[PathBuf]) -> Result<LintReport, LintError> {
        if paths.is_empty() {
            return Ok(LintReport::default());
        }

        let output = Command::new(&self.program)
            .args(&self.args)
            .args(paths)
            .output()
            .map_err(|source| LintError::Spawn {
                command: self.command_line(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let findings: Vec<LintFinding> = stdout.lines().filter_map(parse_unix_line).collect();

        if !output.status.success() && findings.is_empty() {
            return Err(LintError::Crashed {
                command: self.command_line(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(LintReport { findings })
    }
}

/// Parse one `path:line:column: message [Severity/rule]` line.
fn parse_unix_line(line: &str) -> Option<LintFinding> {
    let (path, line_no, column, rest) = line.match_indices(':').find_map(|(i, _)| {
        let (line_no, rest) = line[i + 1..].split_once(':')?;
        let (column, rest) = rest.split_once(": ")?;
        Some((
            &line[..i],
            line_no.parse::<u32>().ok()?,
            column.parse::<u32>().ok()?,
            rest,
        ))
    })?;
    if path.is_empty() {
        return None;
    }

    let (message, severity, rule) = match rest.rsplit_once(" [") {
        Some((message, tag)) if tag.ends_with(']') => {
            let tag = &tag[..tag.len() - 1];
            let (severity, rule) = tag.split_once('/').unwrap_or((tag, ""));
            let severity = if severity.eq_ignore_ascii_case("warning") {
                Severity::Warning
            } else {
                Severity::Error
            };
            (message, severity, (!rule.is_empty()).then(|| rule.to_string()))
        }
        _ => (rest, Severity::Error, None),
    };

    Some(LintFinding {
        path: PathBuf::from(path),
        line: Some(line_no),
        column: Some(column),
        message: message.to_string(),
        rule,
        severity,
    })
}
