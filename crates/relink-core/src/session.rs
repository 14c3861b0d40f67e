//! Watch sessions.
//!
//! A [`WatchSession`] owns one [`Bundler`] and turns a stream of file
//! changes into debounced rebuilds: `Idle -> Debouncing -> Rebuilding ->
//! Idle`, re-entering `Debouncing` when changes arrive mid-rebuild. At most
//! one rebuild runs at a time and every accepted change is eventually built.

use crate::artifact::{ArtifactLocation, BuildArtifact};
use crate::bundler::{BuildOutcome, Bundler};
use crate::config::BundleConfig;
use crate::error::{BuildError, Diagnostic};
use crate::invalidate::{ChangeKind, ChangeSet};
use crate::watch::{settle, FsEvent, FsWatcher, WatchError, WatchFilter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Session events kept for slow subscribers before they start lagging.
const EVENT_CAPACITY: usize = 64;

/// Phase of a [`WatchMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Debouncing,
    Rebuilding,
}

/// A rebuild the machine wants started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rebuild {
    pub changes: ChangeSet,
}

/// Debounce and single-flight rules, without any I/O or clock of its own.
#[derive(Debug, Clone)]
pub struct WatchMachine {
    debounce: Duration,
    pending: ChangeSet,
    last_change: Option<Instant>,
    rebuilding: bool,
}

impl WatchMachine {
    #[must_use]
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: ChangeSet::new(),
            last_change: None,
            rebuilding: false,
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        if self.rebuilding {
            Phase::Rebuilding
        } else if self.last_change.is_some() {
            Phase::Debouncing
        } else {
            Phase::Idle
        }
    }

    /// Record a change observed at `now`. Restarts the quiet period.
    /// `path` is taken as already canonical; see [`settle`].
    pub fn on_change(&mut self, path: &Path, kind: ChangeKind, now: Instant) {
        self.pending.insert_canonical(path.to_path_buf(), kind);
        self.last_change = Some(now);
    }

    /// When the next rebuild may start, if one is waiting.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        if self.rebuilding {
            return None;
        }
        self.last_change.map(|at| at + self.debounce)
    }

    /// Start a rebuild if the quiet period has elapsed and none is running.
    pub fn poll(&mut self, now: Instant) -> Option<Rebuild> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        self.rebuilding = true;
        self.last_change = None;
        Some(Rebuild {
            changes: std::mem::take(&mut self.pending),
        })
    }

    /// The running rebuild is done. Changes that arrived meanwhile stay
    /// pending, and their quiet period continues from their last event.
    pub fn on_rebuild_finished(&mut self) {
        self.rebuilding = false;
    }
}

/// Outcome of one rebuild, as broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    RebuildComplete {
        artifact: Arc<BuildArtifact>,
        affected: Vec<PathBuf>,
        /// Where the artifact was written, when the session publishes.
        location: Option<ArtifactLocation>,
    },
    RebuildFailed {
        errors: Vec<Diagnostic>,
    },
}

/// Downstream consumer told about every published artifact, e.g. a
/// live-reload server.
pub trait ReloadTarget: Send + Sync {
    fn artifact_ready(&self, location: &ArtifactLocation);
}

#[derive(Clone)]
pub struct SessionOptions {
    pub debounce: Duration,
    /// Write each successful artifact to the output directory.
    pub publish: bool,
    /// Start a filesystem watcher on the project root. Without it, changes
    /// only come in through [`WatchSession::notifier`].
    pub watch_filesystem: bool,
    pub reload_targets: Vec<Arc<dyn ReloadTarget>>,
}

impl SessionOptions {
    #[must_use]
    pub fn from_config(config: &BundleConfig) -> Self {
        Self {
            debounce: config.debounce(),
            publish: true,
            watch_filesystem: true,
            reload_targets: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_reload_target(mut self, target: Arc<dyn ReloadTarget>) -> Self {
        self.reload_targets.push(target);
        self
    }
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("debounce", &self.debounce)
            .field("publish", &self.publish)
            .field("watch_filesystem", &self.watch_filesystem)
            .field("reload_targets", &self.reload_targets.len())
            .finish()
    }
}

/// Feeds changes into a running session.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: mpsc::UnboundedSender<FsEvent>,
}

impl ChangeNotifier {
    /// Returns `false` once the session has stopped. Settling the event
    /// touches the filesystem, so this blocks briefly.
    pub fn notify(&self, path: impl Into<PathBuf>, kind: ChangeKind) -> bool {
        self.tx
            .send(settle(FsEvent {
                path: path.into(),
                kind,
            }))
            .is_ok()
    }
}

/// A running watch session.
#[derive(Debug)]
pub struct WatchSession {
    changes: mpsc::UnboundedSender<FsEvent>,
    events: broadcast::Sender<SessionEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Option<Bundler>>,
    watcher: Option<FsWatcher>,
}

impl WatchSession {
    /// Start driving `bundler`. Must be called inside a tokio runtime.
    ///
    /// The bundler is expected to have run its initial build; if it has not,
    /// the first rebuild is a full build.
    pub fn start(bundler: Bundler, options: SessionOptions) -> Result<Self, WatchError> {
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let watcher = if options.watch_filesystem {
            let filter = WatchFilter::for_bundler(&bundler);
            Some(FsWatcher::start(bundler.root(), filter, changes_tx.clone())?)
        } else {
            None
        };

        info!(
            root = %bundler.root().display(),
            debounce_ms = options.debounce.as_millis() as u64,
            "watch session started"
        );
        let task = tokio::spawn(drive(
            bundler,
            changes_rx,
            shutdown_rx,
            events_tx.clone(),
            options,
        ));

        Ok(Self {
            changes: changes_tx,
            events: events_tx,
            shutdown: Some(shutdown_tx),
            task,
            watcher,
        })
    }

    #[must_use]
    pub fn notifier(&self) -> ChangeNotifier {
        ChangeNotifier {
            tx: self.changes.clone(),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Stop the session. A rebuild in flight is allowed to finish, but its
    /// result is discarded and nothing is written. Returns the bundler.
    pub async fn stop(mut self) -> Option<Bundler> {
        self.watcher = None;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let bundler = self.task.await.ok().flatten();
        info!("watch session stopped");
        bundler
    }
}

type Finished = (Bundler, Result<BuildOutcome, BuildError>);

async fn drive(
    bundler: Bundler,
    mut changes: mpsc::UnboundedReceiver<FsEvent>,
    mut shutdown: oneshot::Receiver<()>,
    events: broadcast::Sender<SessionEvent>,
    options: SessionOptions,
) -> Option<Bundler> {
    let mut machine = WatchMachine::new(options.debounce);
    let mut idle: Option<Bundler> = Some(bundler);
    let mut in_flight: Option<JoinHandle<Finished>> = None;

    loop {
        let deadline = machine.deadline();
        tokio::select! {
            biased;

            _ = &mut shutdown => break,

            joined = join_in_flight(&mut in_flight), if in_flight.is_some() => {
                in_flight = None;
                machine.on_rebuild_finished();
                let Ok((bundler, result)) = joined else {
                    warn!("rebuild task panicked, ending session");
                    return None;
                };
                match finish(bundler, result, &events, &options, &mut shutdown).await {
                    After::Continue(bundler) => idle = Some(bundler),
                    After::Stop(bundler) => return bundler,
                }
            }

            event = changes.recv() => {
                let Some(event) = event else { break };
                machine.on_change(&event.path, event.kind, Instant::now());
            }

            () = sleep_until(deadline), if deadline.is_some() && in_flight.is_none() => {
                let Some(rebuild) = machine.poll(Instant::now()) else { continue };
                let Some(mut bundler) = idle.take() else { break };
                debug!(changes = rebuild.changes.len(), "starting rebuild");
                in_flight = Some(tokio::task::spawn_blocking(move || {
                    let result = bundler.rebuild(&rebuild.changes);
                    (bundler, result)
                }));
            }
        }
    }

    if let Some(handle) = in_flight {
        debug!("waiting for in-flight rebuild before stopping");
        return handle.await.ok().map(|(bundler, _)| bundler);
    }
    idle
}

async fn join_in_flight(
    handle: &mut Option<JoinHandle<Finished>>,
) -> Result<Finished, tokio::task::JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// What the driver does once a rebuild has been handled.
enum After {
    Continue(Bundler),
    Stop(Option<Bundler>),
}

/// Whether `stop` was called or the session handle dropped. After `true`
/// the receiver must not be polled again.
fn stop_requested(shutdown: &mut oneshot::Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(oneshot::error::TryRecvError::Empty))
}

/// Publish a finished rebuild and emit its event. Once stop has been
/// requested the result is dropped without writing or notifying.
async fn finish(
    bundler: Bundler,
    result: Result<BuildOutcome, BuildError>,
    events: &broadcast::Sender<SessionEvent>,
    options: &SessionOptions,
    shutdown: &mut oneshot::Receiver<()>,
) -> After {
    if stop_requested(shutdown) {
        debug!("stopping, rebuild result discarded");
        return After::Stop(Some(bundler));
    }

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(code = e.code(), error = %e, "rebuild failed");
            let _ = events.send(SessionEvent::RebuildFailed {
                errors: e.diagnostics(),
            });
            return After::Continue(bundler);
        }
    };

    let (bundler, location) = if options.publish {
        let artifact = Arc::clone(&outcome.artifact);
        let Ok((bundler, published)) = tokio::task::spawn_blocking(move || {
            let published = bundler.publish(&artifact);
            (bundler, published)
        })
        .await
        else {
            warn!("publish task panicked, ending session");
            return After::Stop(None);
        };
        match published {
            Ok(location) => (bundler, Some(location)),
            Err(e) => {
                warn!(code = e.code(), error = %e, "publish failed");
                let _ = events.send(SessionEvent::RebuildFailed {
                    errors: e.diagnostics(),
                });
                return After::Continue(bundler);
            }
        }
    } else {
        (bundler, None)
    };

    if stop_requested(shutdown) {
        debug!("stopping, rebuild event suppressed");
        return After::Stop(Some(bundler));
    }

    let _ = events.send(SessionEvent::RebuildComplete {
        artifact: outcome.artifact,
        affected: outcome.affected,
        location: location.clone(),
    });
    if let Some(location) = &location {
        for target in &options.reload_targets {
            target.artifact_ready(location);
        }
    }
    After::Continue(bundler)
}
