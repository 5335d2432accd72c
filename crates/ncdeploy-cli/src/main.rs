mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::flags::FlagsSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ncdeploy",
    about = "Flag-driven reconciliation for a Nextcloud deployment: one pass per delivered event",
    version,
    propagate_version = true
)]
struct Cli {
    /// Deployment root (default: auto-detect from .ncdeploy/)
    #[arg(long, global = true, env = "NCDEPLOY_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Log at debug level
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .ncdeploy/ with default settings and an empty facts file
    Init,

    /// Handle one delivered event and reconcile to a fixed point
    Hook {
        /// Hook name, e.g. db-relation-changed, data-storage-attached, update-status
        event: String,
    },

    /// Inspect or override persisted flags
    Flags {
        #[command(subcommand)]
        subcommand: FlagsSubcommand,
    },

    /// Show the last published status and storage migration state
    Status,

    /// Show recent reconciliation passes
    History {
        /// Number of passes to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// List registered actions with their conditions and current eligibility
    Actions,

    /// Validate settings and the action registry
    Check,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        match &cli.command {
            Commands::Hook { .. } => tracing::Level::INFO,
            _ => tracing::Level::WARN,
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Hook { event } => cmd::hook::run(&root, &event, cli.json),
        Commands::Flags { subcommand } => cmd::flags::run(&root, subcommand, cli.json),
        Commands::Status => cmd::status::run(&root, cli.json),
        Commands::History { limit } => cmd::history::run(&root, limit, cli.json),
        Commands::Actions => cmd::actions::run(&root, cli.json),
        Commands::Check => cmd::check::run(&root, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
