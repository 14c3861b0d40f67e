//! Source Map V3 model.
//!
//! Per-module maps are produced by the transform pipeline; the linker merges
//! them with [`SourceMapBuilder`], shifting each by the line its module body
//! starts on in the bundle.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const B64: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// One mapping segment. All positions are 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Mapping {
    pub generated_line: u32,
    pub generated_column: u32,
    pub source: u32,
    pub original_line: u32,
    pub original_column: u32,
}

/// Decoded source map.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceMap {
    pub file: Option<String>,
    pub sources: Vec<String>,
    pub sources_content: Vec<String>,
    /// Sorted by generated position.
    pub mappings: Vec<Mapping>,
}

#[derive(Error, Debug)]
pub enum SourceMapError {
    #[error("invalid source map JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported source map version {0}")]
    Version(u32),

    #[error("invalid VLQ data in mappings at segment {0}")]
    Vlq(usize),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSourceMap {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    sources: Vec<String>,
    #[serde(default)]
    sources_content: Vec<Option<String>>,
    #[serde(default)]
    names: Vec<String>,
    mappings: String,
}

impl SourceMap {
    /// Map for a single module whose generated line `i` came from original
    /// line `line_map[i]`.
    #[must_use]
    pub fn for_module(source: &str, content: &str, line_map: &[u32]) -> Self {
        let mappings = line_map
            .iter()
            .enumerate()
            .map(|(generated, &original)| Mapping {
                generated_line: u32::try_from(generated).unwrap_or(u32::MAX),
                generated_column: 0,
                source: 0,
                original_line: original,
                original_column: 0,
            })
            .collect();

        Self {
            file: None,
            sources: vec![source.to_string()],
            sources_content: vec![content.to_string()],
            mappings,
        }
    }

    /// Find the segment covering a generated position.
    #[must_use]
    pub fn lookup(&self, line: u32, column: u32) -> Option<&Mapping> {
        self.mappings
            .iter()
            .rev()
            .find(|m| m.generated_line == line && m.generated_column <= column)
    }

    /// Encode the `mappings` field.
    #[must_use]
    pub fn encode_mappings(&self) -> String {
        let mut out = String::new();
        let mut line = 0u32;
        let mut prev_column = 0i64;
        let mut prev_source = 0i64;
        let mut prev_original_line = 0i64;
        let mut prev_original_column = 0i64;
        let mut first_on_line = true;

        for m in &self.mappings {
            while line < m.generated_line {
                out.push(';');
                line += 1;
                prev_column = 0;
                first_on_line = true;
            }
            if !first_on_line {
                out.push(',');
            }
            first_on_line = false;

            vlq_encode(i64::from(m.generated_column) - prev_column, &mut out);
            vlq_encode(i64::from(m.source) - prev_source, &mut out);
            vlq_encode(i64::from(m.original_line) - prev_original_line, &mut out);
            vlq_encode(i64::from(m.original_column) - prev_original_column, &mut out);

            prev_column = i64::from(m.generated_column);
            prev_source = i64::from(m.source);
            prev_original_line = i64::from(m.original_line);
            prev_original_column = i64::from(m.original_column);
        }
        out
    }

    /// Serialize as V3 JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let raw = RawSourceMap {
            version: 3,
            file: self.file.clone(),
            sources: self.sources.clone(),
            sources_content: self.sources_content.iter().cloned().map(Some).collect(),
            names: Vec::new(),
            mappings: self.encode_mappings(),
        };
        serde_json::to_string(&raw)
    }

    /// Parse V3 JSON. Segments without an original position are dropped.
    pub fn from_json(json: &str) -> Result<Self, SourceMapError> {
        let raw: RawSourceMap = serde_json::from_str(json)?;
        if raw.version != 3 {
            return Err(SourceMapError::Version(raw.version));
        }

        Ok(Self {
            file: raw.file,
            sources: raw.sources,
            sources_content: raw
                .sources_content
                .into_iter()
                .map(Option::unwrap_or_default)
                .collect(),
            mappings: decode_mappings(&raw.mappings)?,
        })
    }
}

/// Decode a `mappings` string.
pub fn decode_mappings(encoded: &str) -> Result<Vec<Mapping>, SourceMapError> {
    let mut mappings = Vec::new();
    let mut source = 0i64;
    let mut original_line = 0i64;
    let mut original_column = 0i64;
    let mut segment_index = 0usize;

    for (line, group) in encoded.split(';').enumerate() {
        let mut column = 0i64;
        for segment in group.split(',').filter(|s| !s.is_empty()) {
            let fields = vlq_decode(segment).ok_or(SourceMapError::Vlq(segment_index))?;
            segment_index += 1;
            column += fields[0];
            if fields.len() < 4 {
                continue;
            }
            source += fields[1];
            original_line += fields[2];
            original_column += fields[3];

            let at = segment_index - 1;
            let to_u32 = |v: i64| u32::try_from(v).map_err(|_| SourceMapError::Vlq(at));
            mappings.push(Mapping {
                generated_line: u32::try_from(line).map_err(|_| SourceMapError::Vlq(at))?,
                generated_column: to_u32(column)?,
                source: to_u32(source)?,
                original_line: to_u32(original_line)?,
                original_column: to_u32(original_column)?,
            });
        }
    }
    Ok(mappings)
}

/// VLQ-encode a signed integer and append to output string.
fn vlq_encode(value: i64, out: &mut String) {
    #[allow(clippy::cast_sign_loss)]
    let mut v = (if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    }) as u64;
    loop {
        let mut digit = (v & 0x1f) as u8;
        v >>= 5;
        if v > 0 {
            digit |= 0x20;
        }
        out.push(B64[digit as usize] as char);
        if v == 0 {
            break;
        }
    }
}

/// Decode every VLQ value in one segment.
fn vlq_decode(segment: &str) -> Option<Vec<i64>> {
    let mut values = Vec::new();
    let mut value = 0i64;
    let mut shift = 0u32;

    for byte in segment.bytes() {
        let digit = i64::try_from(B64.iter().position(|&b| b == byte)?).ok()?;
        value |= (digit & 0x1f) << shift;
        if digit & 0x20 == 0 {
            let decoded = if value & 1 == 1 { -(value >> 1) } else { value >> 1 };
            values.push(decoded);
            value = 0;
            shift = 0;
        } else {
            shift += 5;
            if shift > 60 {
                return None;
            }
        }
    }

    if shift != 0 || values.is_empty() {
        return None;
    }
    Some(values)
}

/// Concatenates per-module maps into one bundle map.
#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    sources: Vec<String>,
    sources_content: Vec<String>,
    mappings: Vec<Mapping>,
}

impl SourceMapBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `map`, whose generated line 0 sits at `line_offset` in the bundle.
    pub fn append(&mut self, map: &SourceMap, line_offset: u32) {
        self.append_lines(map, line_offset, u32::MAX);
    }

    /// Like [`append`](Self::append), keeping only the first `lines`
    /// generated lines of `map`.
    pub fn append_lines(&mut self, map: &SourceMap, line_offset: u32, lines: u32) {
        let base = u32::try_from(self.sources.len()).unwrap_or(u32::MAX);
        self.sources.extend(map.sources.iter().cloned());
        self.sources_content.extend(map.sources_content.iter().cloned());
        self.mappings.extend(
            map.mappings
                .iter()
                .filter(|m| m.generated_line < lines)
                .map(|m| Mapping {
                    generated_line: m.generated_line + line_offset,
                    source: m.source + base,
                    ..*m
                }),
        );
    }

    /// Finish into a map for bundle file `file`.
    #[must_use]
    pub fn build(mut self, file: &str) -> SourceMap {
        self.mappings.sort();
        SourceMap {
            file: Some(file.to_string()),
            sources: self.sources,
            sources_content: self.sources_content,
            mappings: self.mappings,
        }
    }
}
