//! Module transform pipeline.
//!
//! A [`Transform`] turns one module's raw bytes into executable code, a
//! per-module source map and the ordered list of specifiers it imports. The
//! default implementation, [`TransformPipeline`], runs a list of
//! line-preserving [`TransformStage`]s followed by the dependency scanner.
//!
//! Implementations must be deterministic: identical bytes and configuration
//! produce identical output. They are called from worker threads, so the
//! trait is `Send + Sync`.

mod stages;

pub use stages::{Define, JsonModule, NormalizeNewlines};

use crate::config::BundleConfig;
use crate::scan::scan_imports;
use crate::sourcemap::SourceMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Line/column in the original source (1-indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

/// Malformed module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformError {
    pub path: PathBuf,
    /// Stable error code.
    pub code: &'static str,
    pub message: String,
    pub location: Option<SourceLocation>,
    /// Specifiers found before the failure; still traversed.
    pub partial_imports: Vec<String>,
}

impl TransformError {
    #[must_use]
    pub fn new(path: &Path, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            code,
            message: message.into(),
            location: None,
            partial_imports: Vec::new(),
        }
    }

    #[must_use]
    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.location = Some(SourceLocation { line, column });
        self
    }

    #[must_use]
    pub fn with_partial_imports(mut self, imports: Vec<String>) -> Self {
        self.partial_imports = imports;
        self
    }
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())?;
        if let Some(loc) = self.location {
            write!(f, ":{}:{}", loc.line, loc.column)?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for TransformError {}

/// Result of transforming one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub code: String,
    pub map: SourceMap,
    /// Imported specifiers in first-appearance order.
    pub imports: Vec<String>,
}

/// Transform capability used by the graph builder.
pub trait Transform: Send + Sync {
    /// Name for log lines.
    fn name(&self) -> &'static str;

    /// Transform module `path`. `source_name` is the root-relative name
    /// recorded in the source map.
    fn transform(
        &self,
        path: &Path,
        source_name: &str,
        raw: &[u8],
    ) -> Result<TransformOutput, TransformError>;
}

/// Output of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutput {
    pub code: String,
    /// Output line -> input line. `None` when lines map one to one.
    pub line_map: Option<Vec<u32>>,
}

impl StageOutput {
    /// Line-preserving output.
    #[must_use]
    pub fn unchanged_lines(code: String) -> Self {
        Self {
            code,
            line_map: None,
        }
    }
}

/// One step of the pipeline.
pub trait TransformStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the stage runs for `path`.
    fn applies_to(&self, _path: &Path) -> bool {
        true
    }

    fn apply(&self, path: &Path, code: &str) -> Result<StageOutput, TransformError>;
}

/// Ordered list of stages plus dependency scanning.
#[derive(Default)]
pub struct TransformPipeline {
    stages: Vec<Box<dyn TransformStage>>,
}

impl TransformPipeline {
    /// Pipeline without stages: UTF-8 check and scanning only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default stages for a config: newline normalization, defines, JSON modules.
    #[must_use]
    pub fn from_config(config: &BundleConfig) -> Self {
        let mut pipeline = Self::new().with_stage(NormalizeNewlines);
        if !config.define.is_empty() {
            pipeline = pipeline.with_stage(Define::new(config.define.clone()));
        }
        pipeline.with_stage(JsonModule)
    }

    #[must_use]
    pub fn with_stage(mut self, stage: impl TransformStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Stage names in run order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

impl fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl Transform for TransformPipeline {
    fn name(&self) -> &'static str {
        "pipeline"
    }

    fn transform(
        &self,
        path: &Path,
        source_name: &str,
        raw: &[u8],
    ) -> Result<TransformOutput, TransformError> {
        let original = std::str::from_utf8(raw).map_err(|e| {
            TransformError::new(path, "TRANSFORM_INVALID_UTF8", format!("module is not UTF-8: {e}"))
        })?;

        let mut code = original.to_string();
        let mut line_map: Vec<u32> = (0..line_count(original)).collect();

        for stage in self.stages.iter().filter(|s| s.applies_to(path)) {
            let out = stage.apply(path, &code)?;
            let produced = line_count(&out.code) as usize;
            line_map = match out.line_map {
                Some(map) => map
                    .iter()
                    .map(|&input| line_map[(input as usize).min(line_map.len() - 1)])
                    .collect(),
                None => (0..produced)
                    .map(|i| line_map[i.min(line_map.len() - 1)])
                    .collect(),
            };
            code = out.code;
        }

        let imports = match scan_imports(&code) {
            Ok(refs) => refs.into_iter().map(|r| r.specifier).collect(),
            Err(e) => {
                let line = line_map
                    .get(e.line.saturating_sub(1) as usize)
                    .map_or(e.line, |l| l + 1);
                return Err(TransformError::new(path, "TRANSFORM_SYNTAX_ERROR", e.message)
                    .at(line, e.column)
                    .with_partial_imports(e.partial.into_iter().map(|r| r.specifier).collect()));
            }
        };

        Ok(TransformOutput {
            map: SourceMap::for_module(source_name, original, &line_map),
            code,
            imports,
        })
    }
}

/// Number of lines; never zero.
fn line_count(text: &str) -> u32 {
    u32::try_from(text.split('\n').count()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_pipeline_output_and_map() {
        let pipeline = TransformPipeline::from_config(&BundleConfig::default());
        let raw = b"var b = require('./b');\r\nmodule.exports = b + 1;\r\n";
        let out = pipeline
            .transform(Path::new("/p/src/a.js"), "src/a.js", raw)
            .unwrap();

        assert_eq!(out.code, "var b = require('./b');\nmodule.exports = b + 1;\n");
        assert_eq!(out.imports, vec!["./b"]);
        assert_eq!(out.map.sources, vec!["src/a.js"]);
        assert_eq!(
            out.map.sources_content,
            vec!["var b = require('./b');\r\nmodule.exports = b + 1;\r\n"]
        );
        assert_eq!(out.map.mappings.len(), 3);
        assert_eq!(out.map.mappings[1].original_line, 1);
    }

    #[test]
    fn test_define_stage_runs_from_config() {
        let mut define = BTreeMap::new();
        define.insert("process.env.NODE_ENV".to_string(), "\"production\"".to_string());
        let config = BundleConfig {
            define,
            ..Default::default()
        };
        let pipeline = TransformPipeline::from_config(&config);
        assert_eq!(
            pipeline.stage_names(),
            vec!["normalize-newlines", "define", "json-module"]
        );

        let out = pipeline
            .transform(
                Path::new("/p/a.js"),
                "a.js",
                b"if (process.env.NODE_ENV !== 'production') {}",
            )
            .unwrap();
        assert_eq!(out.code, "if (\"production\" !== 'production') {}");
    }

    #[test]
    fn test_invalid_utf8() {
        let err = TransformPipeline::new()
            .transform(Path::new("/p/a.js"), "a.js", &[0xff, 0xfe, 0x00])
            .unwrap_err();
        assert_eq!(err.code, "TRANSFORM_INVALID_UTF8");
        assert_eq!(err.path, PathBuf::from("/p/a.js"));
    }

    #[test]
    fn test_syntax_error_keeps_partial_imports() {
        let err = TransformPipeline::new()
            .transform(
                Path::new("/p/a.js"),
                "a.js",
                b"require('./ok');\nvar s = \"unterminated;\n",
            )
            .unwrap_err();
        assert_eq!(err.code, "TRANSFORM_SYNTAX_ERROR");
        assert_eq!(err.location, Some(SourceLocation { line: 2, column: 9 }));
        assert_eq!(err.partial_imports, vec!["./ok"]);
        assert_eq!(
            err.to_string(),
            "/p/a.js:2:9: unterminated string literal"
        );
    }

    #[test]
    fn test_deterministic() {
        let pipeline = TransformPipeline::from_config(&BundleConfig::default());
        let raw = b"import x from './x';\nexport default x;\n";
        let a = pipeline.transform(Path::new("/p/a.js"), "a.js", raw).unwrap();
        let b = pipeline.transform(Path::new("/p/a.js"), "a.js", raw).unwrap();
        assert_eq!(a, b);
    }
}
