//! `relink build` command implementation.
//!
//! One full build: lint gate, graph, link, publish.

use super::{diagnostics_json, kilobytes, names, print_failure, DiagnosticJson};
use miette::{IntoDiagnostic, Result};
use relink_core::paths::display_name;
use relink_core::{BuildError, BundleConfig, Bundler};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;

/// JSON output for the build command.
#[derive(Serialize)]
struct BuildResultJson {
    ok: bool,
    entry: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    bundle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_map: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    modules: Vec<String>,
    size_bytes: usize,
    duration_ms: u64,
    errors: Vec<DiagnosticJson>,
}

/// Run the build command. Exits non-zero when the build fails.
pub fn run(config: Result<BundleConfig, BuildError>, json: bool) -> Result<()> {
    let start = Instant::now();
    let entry = config
        .as_ref()
        .map(|c| c.entry.clone())
        .unwrap_or_default();

    let mut root: Option<PathBuf> = None;
    let result = config.and_then(Bundler::new).and_then(|mut bundler| {
        root = Some(bundler.root().to_path_buf());
        let outcome = bundler.full_build()?;
        let location = bundler.publish(&outcome.artifact)?;
        Ok((outcome, location))
    });
    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    match result {
        Ok((outcome, location)) => {
            let root = root.unwrap_or_default();
            let artifact = &outcome.artifact;
            let size_bytes = artifact.bytes().len();

            if json {
                let result = BuildResultJson {
                    ok: true,
                    entry,
                    bundle: Some(location.bundle.display().to_string()),
                    source_map: Some(location.source_map.display().to_string()),
                    hash: Some(artifact.hash().to_hex()),
                    modules: names(&root, artifact.module_order()),
                    size_bytes,
                    duration_ms,
                    errors: Vec::new(),
                };
                println!("{}", serde_json::to_string(&result).into_diagnostic()?);
            } else {
                println!(
                    "  {} -> {} ({} modules, {:.1}KB, {}ms)",
                    entry,
                    display_name(&root, &location.bundle),
                    artifact.module_order().len(),
                    kilobytes(size_bytes),
                    duration_ms
                );
            }
            Ok(())
        }
        Err(e) => {
            tracing::debug!(code = e.code(), "build failed");
            if json {
                let result = BuildResultJson {
                    ok: false,
                    entry,
                    bundle: None,
                    source_map: None,
                    hash: None,
                    modules: Vec::new(),
                    size_bytes: 0,
                    duration_ms,
                    errors: diagnostics_json(root.as_deref(), &e),
                };
                println!("{}", serde_json::to_string(&result).into_diagnostic()?);
            } else {
                print_failure(root.as_deref(), &e);
            }
            std::process::exit(1);
        }
    }
}
