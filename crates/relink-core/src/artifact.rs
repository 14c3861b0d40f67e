//! Build artifacts and their publication.

use relink_util::fs::atomic_write;
use relink_util::hash::ContentHash;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Output of one successful link. Immutable; every rebuild produces a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    bytes: Vec<u8>,
    source_map: String,
    module_order: Vec<PathBuf>,
    hash: ContentHash,
    out_file: String,
    map_file: String,
}

/// Where an artifact was published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactLocation {
    pub bundle: PathBuf,
    pub source_map: PathBuf,
}

impl BuildArtifact {
    pub(crate) fn new(
        bytes: Vec<u8>,
        source_map: String,
        module_order: Vec<PathBuf>,
        out_file: String,
        map_file: String,
    ) -> Self {
        let hash = ContentHash::of(&bytes);
        Self {
            bytes,
            source_map,
            module_order,
            hash,
            out_file,
            map_file,
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Bundle text. Always valid UTF-8 since every module passed the transform.
    #[must_use]
    pub fn code(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or_default()
    }

    /// Merged source map as V3 JSON.
    #[must_use]
    pub fn source_map(&self) -> &str {
        &self.source_map
    }

    /// Module identities in emission order.
    #[must_use]
    pub fn module_order(&self) -> &[PathBuf] {
        &self.module_order
    }

    #[must_use]
    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    #[must_use]
    pub fn out_file(&self) -> &str {
        &self.out_file
    }

    #[must_use]
    pub fn map_file(&self) -> &str {
        &self.map_file
    }

    /// Write the map and then the bundle into `out_dir`, each atomically, so
    /// a reader that sees the new bundle also finds its map.
    pub fn publish(&self, out_dir: &Path) -> std::io::Result<ArtifactLocation> {
        let location = ArtifactLocation {
            bundle: out_dir.join(&self.out_file),
            source_map: out_dir.join(&self.map_file),
        };
        atomic_write(&location.source_map, self.source_map.as_bytes())?;
        atomic_write(&location.bundle, &self.bytes)?;
        tracing::debug!(
            bundle = %location.bundle.display(),
            hash = %self.hash.short(),
            bytes = self.bytes.len(),
            "published artifact"
        );
        Ok(location)
    }
}
