//! Built-in pipeline stages. All of them keep line structure intact.

use super::{StageOutput, TransformError, TransformStage};
use crate::scan::literal_spans;
use std::collections::BTreeMap;
use std::path::Path;

/// Strips a UTF-8 BOM and converts CRLF line endings to LF.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeNewlines;

impl TransformStage for NormalizeNewlines {
    fn name(&self) -> &'static str {
        "normalize-newlines"
    }

    fn apply(&self, _path: &Path, code: &str) -> Result<StageOutput, TransformError> {
        let code = code.strip_prefix('\u{feff}').unwrap_or(code);
        Ok(StageOutput::unchanged_lines(code.replace("\r\n", "\n")))
    }
}

/// Replaces identifier expressions such as `process.env.NODE_ENV` with
/// literal values.
///
/// A match must sit on identifier boundaries: `process.env.NODE_ENV_X` and
/// `foo.process.env.NODE_ENV` are left alone. Comments, string literals,
/// template text and regular expressions are copied through untouched.
#[derive(Debug, Clone, Default)]
pub struct Define {
    /// Longest key first so overlapping keys resolve to the most specific.
    replacements: Vec<(String, String)>,
}

impl Define {
    #[must_use]
    pub fn new(replacements: BTreeMap<String, String>) -> Self {
        let mut replacements: Vec<_> = replacements
            .into_iter()
            .filter(|(from, _)| !from.is_empty())
            .map(|(from, to)| (from, to.replace('\n', " ")))
            .collect();
        replacements.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { replacements }
    }
}

impl TransformStage for Define {
    fn name(&self) -> &'static str {
        "define"
    }

    fn apply(&self, _path: &Path, code: &str) -> Result<StageOutput, TransformError> {
        if self.replacements.is_empty() {
            return Ok(StageOutput::unchanged_lines(code.to_string()));
        }

        let mut out = String::with_capacity(code.len());
        let mut i = 0;
        let bytes = code.as_bytes();
        let mut literals = literal_spans(code).into_iter().peekable();
        'outer: while i < code.len() {
            if let Some(span) = literals.next_if(|span| span.start <= i) {
                let end = span.end.max(i);
                out.push_str(&code[i..end]);
                i = end;
                continue;
            }
            let at_boundary = i == 0 || !is_ident_or_dot(bytes[i - 1]);
            if at_boundary {
                for (from, to) in &self.replacements {
                    let end = i + from.len();
                    if code[i..].starts_with(from.as_str())
                        && (end == code.len() || !is_ident_byte(bytes[end]))
                    {
                        out.push_str(to);
                        i = end;
                        continue 'outer;
                    }
                }
            }
            let ch_len = code[i..].chars().next().map_or(1, char::len_utf8);
            out.push_str(&code[i..i + ch_len]);
            i += ch_len;
        }

        Ok(StageOutput::unchanged_lines(out))
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn is_ident_or_dot(b: u8) -> bool {
    is_ident_byte(b) || b == b'.'
}

/// Wraps `.json` modules as `module.exports = <json>;`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonModule;

impl TransformStage for JsonModule {
    fn name(&self) -> &'static str {
        "json-module"
    }

    fn applies_to(&self, path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "json")
    }

    fn apply(&self, path: &Path, code: &str) -> Result<StageOutput, TransformError> {
        if let Err(e) = serde_json::from_str::<serde_json::Value>(code) {
            let line = u32::try_from(e.line()).unwrap_or(u32::MAX);
            let column = u32::try_from(e.column()).unwrap_or(u32::MAX);
            return Err(
                TransformError::new(path, "TRANSFORM_INVALID_JSON", e.to_string()).at(line, column)
            );
        }
        Ok(StageOutput::unchanged_lines(format!(
            "module.exports = {};",
            code.trim_end()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(stage: &dyn TransformStage, code: &str) -> String {
        stage.apply(Path::new("/p/a.js"), code).unwrap().code
    }

    #[test]
    fn test_normalize_newlines() {
        assert_eq!(apply(&NormalizeNewlines, "\u{feff}a\r\nb\r\n"), "a\nb\n");
        assert_eq!(apply(&NormalizeNewlines, "a\nb"), "a\nb");
    }

    fn define(pairs: &[(&str, &str)]) -> Define {
        Define::new(
            pairs
                .iter()
                .map(|(from, to)| ((*from).to_string(), (*to).to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_define_respects_boundaries() {
        let stage = define(&[
            ("process.env.NODE_ENV", "\"development\""),
            ("process.env.NODE_ENV_X", "\"x\""),
        ]);

        assert_eq!(
            apply(&stage, "process.env.NODE_ENV;"),
            "\"development\";"
        );
        assert_eq!(apply(&stage, "process.env.NODE_ENV_X"), "\"x\"");
        assert_eq!(apply(&stage, "process.env.NODE_ENVY"), "process.env.NODE_ENVY");
        assert_eq!(
            apply(&stage, "foo.process.env.NODE_ENV"),
            "foo.process.env.NODE_ENV"
        );
    }

    #[test]
    fn test_define_non_ascii_passthrough() {
        let mut map = BTreeMap::new();
        map.insert("__DEV__".to_string(), "false".to_string());
        let stage = Define::new(map);
        assert_eq!(apply(&stage, "var é = __DEV__ ? 'ü' : 1;"), "var é = false ? 'ü' : 1;");
    }

    #[test]
    fn test_define_skips_strings_and_comments() {
        let stage = define(&[("process.env.NODE_ENV", "\"production\"")]);
        assert_eq!(
            apply(
                &stage,
                "var msg = \"mode: process.env.NODE_ENV\"; // process.env.NODE_ENV"
            ),
            "var msg = \"mode: process.env.NODE_ENV\"; // process.env.NODE_ENV"
        );
        assert_eq!(
            apply(
                &stage,
                "/* process.env.NODE_ENV */ if (process.env.NODE_ENV === 'production') {}"
            ),
            "/* process.env.NODE_ENV */ if (\"production\" === 'production') {}"
        );
        assert_eq!(
            apply(&stage, "`process.env.NODE_ENV ${process.env.NODE_ENV}`"),
            "`process.env.NODE_ENV ${\"production\"}`"
        );
    }

    #[test]
    fn test_json_module() {
        let path = Path::new("/p/data.json");
        assert!(JsonModule.applies_to(path));
        assert!(!JsonModule.applies_to(Path::new("/p/a.js")));

        let out = JsonModule.apply(path, "{\n  \"a\": 1\n}\n").unwrap();
        assert_eq!(out.code, "module.exports = {\n  \"a\": 1\n};");

        let err = JsonModule.apply(path, "{\n  \"a\": \n}").unwrap_err();
        assert_eq!(err.code, "TRANSFORM_INVALID_JSON");
        assert_eq!(err.location.map(|l| l.line), Some(3));
    }
}
