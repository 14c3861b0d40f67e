#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! Incremental module bundler.
//!
//! Resolves an entry module's import graph, transforms each module, links
//! the graph into one artifact with a merged source map, and keeps the graph
//! alive between builds so a file change only recomputes what depends on it.

pub mod artifact;
pub mod builder;
pub mod bundler;
pub mod config;
pub mod error;
pub mod graph;
pub mod invalidate;
pub mod link;
pub mod lint;
pub mod paths;
pub mod resolver;
pub mod scan;
pub mod session;
pub mod sourcemap;
pub mod transform;
pub mod watch;

pub use artifact::{ArtifactLocation, BuildArtifact};
pub use bundler::{BuildOutcome, Bundler};
pub use config::{BundleConfig, ConfigError, FailurePolicy, LintMode, CONFIG_FILE};
pub use error::{BuildError, Diagnostic, LinkError, ModuleError};
pub use invalidate::{ChangeKind, ChangeSet};
pub use session::{
    ChangeNotifier, ReloadTarget, SessionEvent, SessionOptions, WatchMachine, WatchSession,
};
pub use watch::{FsEvent, WatchError};

/// Version of the relink engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
