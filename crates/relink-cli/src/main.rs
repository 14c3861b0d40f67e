#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

mod commands;
mod logging;

use clap::Parser;
use commands::{load_config, Overrides};
use miette::{IntoDiagnostic, Result};
use relink_core::{BuildError, LintMode};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "relink")]
#[command(author, version, about = "Incremental module bundler with watch mode", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    /// Config file to use instead of the project's relink.json
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct BundleArgs {
    /// Entry module, relative to the project root
    #[arg(long)]
    entry: Option<String>,

    /// Artifact directory
    #[arg(long, value_name = "DIR")]
    out_dir: Option<PathBuf>,

    /// Fail the build on any lint error
    #[arg(long, conflicts_with = "no_lint")]
    strict_lint: bool,

    /// Skip the lint gate
    #[arg(long)]
    no_lint: bool,
}

impl BundleArgs {
    fn overrides(&self, debounce_ms: Option<u64>) -> Overrides {
        let lint_mode = if self.no_lint {
            Some(LintMode::Off)
        } else if self.strict_lint {
            Some(LintMode::Strict)
        } else {
            None
        };
        Overrides {
            entry: self.entry.clone(),
            out_dir: self.out_dir.clone(),
            lint_mode,
            debounce_ms,
        }
    }
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Build the bundle once and write it to the output directory
    Build {
        #[command(flatten)]
        args: BundleArgs,
    },

    /// Build, then rebuild on every source change until interrupted
    Watch {
        #[command(flatten)]
        args: BundleArgs,

        /// Quiet period after the last change before rebuilding
        #[arg(long, value_name = "MS")]
        debounce_ms: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = match cli.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().into_diagnostic()?,
    };

    logging::init(cli.verbose, cli.json);

    match cli.command {
        Commands::Build { args } => {
            let span = tracing::info_span!("build", cmd = "build", cwd = %cwd.display());
            let _guard = span.enter();
            let config = load_config(&cwd, cli.config.as_deref(), &args.overrides(None))
                .map_err(BuildError::from);
            commands::build::run(config, cli.json)
        }
        Commands::Watch { args, debounce_ms } => {
            let span = tracing::info_span!("watch", cmd = "watch", cwd = %cwd.display());
            let _guard = span.enter();
            let config = load_config(&cwd, cli.config.as_deref(), &args.overrides(debounce_ms))
                .into_diagnostic()?;
            commands::watch::run(config, cli.json)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_lint_flags() {
        let cli = Cli::parse_from(["relink", "build", "--strict-lint"]);
        let Commands::Build { args } = cli.command else {
            panic!("expected build");
        };
        assert_eq!(args.overrides(None).lint_mode, Some(LintMode::Strict));

        let cli = Cli::parse_from(["relink", "watch", "--no-lint", "--debounce-ms", "250"]);
        let Commands::Watch { args, debounce_ms } = cli.command else {
            panic!("expected watch");
        };
        let overrides = args.overrides(debounce_ms);
        assert_eq!(overrides.lint_mode, Some(LintMode::Off));
        assert_eq!(overrides.debounce_ms, Some(250));

        assert!(Cli::try_parse_from(["relink", "build", "--strict-lint", "--no-lint"]).is_err());
    }
}
