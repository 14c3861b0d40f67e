//! `relink watch` command implementation.
//!
//! Runs an initial build, then keeps a watch session alive until Ctrl-C,
//! printing one line (or one JSON object) per rebuild.

use super::{kilobytes, names, print_diagnostics, DiagnosticJson};
use miette::{IntoDiagnostic, Result};
use relink_core::paths::display_name;
use relink_core::{
    ArtifactLocation, BuildArtifact, BundleConfig, Bundler, Diagnostic, SessionEvent,
    SessionOptions, WatchSession,
};
use serde::Serialize;
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;

/// One JSON line per build event.
#[derive(Serialize)]
struct WatchEventJson {
    event: &'static str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    bundle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    affected: Vec<String>,
    errors: Vec<DiagnosticJson>,
}

/// Run the watch command.
pub fn run(config: BundleConfig, json: bool) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    runtime.block_on(watch(config, json))
}

async fn watch(config: BundleConfig, json: bool) -> Result<()> {
    let options = SessionOptions::from_config(&config);
    let mut bundler = Bundler::new(config).into_diagnostic()?;
    let root = bundler.root().to_path_buf();

    let initial = bundler
        .full_build()
        .and_then(|outcome| {
            let location = bundler.publish(&outcome.artifact)?;
            Ok((outcome, location))
        });
    match initial {
        Ok((outcome, location)) => report_success(
            &root,
            "initial_build",
            &outcome.artifact,
            &outcome.affected,
            Some(&location),
            json,
        )?,
        // The session retries from scratch on the next change.
        Err(e) => report_failure(&root, "initial_build", &e.to_string(), &e.diagnostics(), json)?,
    }

    let session = WatchSession::start(bundler, options).into_diagnostic()?;
    let mut events = session.subscribe();
    if !json {
        println!("  watching {} (Ctrl-C to stop)", root.display());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::RebuildComplete { artifact, affected, location }) => {
                    report_success(&root, "rebuild_complete", &artifact, &affected, location.as_ref(), json)?;
                }
                Ok(SessionEvent::RebuildFailed { errors }) => {
                    report_failure(&root, "rebuild_failed", "rebuild failed", &errors, json)?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "dropped build events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.stop().await;
    Ok(())
}

fn report_success(
    root: &Path,
    event: &'static str,
    artifact: &BuildArtifact,
    affected: &[std::path::PathBuf],
    location: Option<&ArtifactLocation>,
    json: bool,
) -> Result<()> {
    if json {
        let line = WatchEventJson {
            event,
            ok: true,
            bundle: location.map(|l| l.bundle.display().to_string()),
            hash: Some(artifact.hash().to_hex()),
            affected: names(root, affected),
            errors: Vec::new(),
        };
        println!("{}", serde_json::to_string(&line).into_diagnostic()?);
    } else {
        let target = location.map_or_else(
            || artifact.out_file().to_string(),
            |l| display_name(root, &l.bundle),
        );
        println!(
            "  {} module(s) changed -> {} ({:.1}KB, {})",
            affected.len(),
            target,
            kilobytes(artifact.bytes().len()),
            artifact.hash().short()
        );
    }
    Ok(())
}

fn report_failure(
    root: &Path,
    event: &'static str,
    headline: &str,
    errors: &[Diagnostic],
    json: bool,
) -> Result<()> {
    if json {
        let line = WatchEventJson {
            event,
            ok: false,
            bundle: None,
            hash: None,
            affected: Vec::new(),
            errors: errors
                .iter()
                .map(|d| DiagnosticJson::new(Some(root), d))
                .collect(),
        };
        println!("{}", serde_json::to_string(&line).into_diagnostic()?);
    } else {
        eprintln!("error: {headline}");
        print_diagnostics(Some(root), errors);
    }
    Ok(())
}
