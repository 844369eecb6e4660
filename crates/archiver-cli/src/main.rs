#![forbid(unsafe_code)]

mod cmd;
mod output;
mod signals;
mod storage;

use anyhow::{Context as _, bail};
use archiver_core::config::{ArchiverConfig, apply_env_overrides, default_config_path, load_config};
use clap::{Parser, Subcommand};
use output::{CliError, OutputMode};
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "archiver: cold-storage archival of tenant messages and flow runs",
    long_about = None
)]
struct Cli {
    /// Path to config.toml (default: <config dir>/archiver/config.toml).
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output format.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Shorthand for `--format json`.
    #[arg(long, global = true, hide = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Create the metadata store and record schema",
        after_help = "EXAMPLES:\n    # Create stores at the configured paths\n    archiver init\n\n    # Use a specific config file\n    archiver --config ./archiver.toml init"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        about = "Archive every active org up to its horizon",
        long_about = "Build, upload, and record day archives for every gap up to each org's horizon, then roll complete months up and purge source records for orgs that do not retain them.",
        after_help = "EXAMPLES:\n    # Archive everything that is due\n    archiver run\n\n    # Replay as of a fixed time, one org only\n    archiver run --now 2018-01-08T12:30:00Z --org 3\n\n    # Stop in-flight work after ten minutes\n    archiver run --deadline-secs 600 --json"
    )]
    Run(cmd::run::RunArgs),

    #[command(
        about = "Show the gaps a run would fill for one org",
        after_help = "EXAMPLES:\n    # Plan both record types\n    archiver plan --org 3\n\n    # Messages only, as of a fixed time\n    archiver plan --org 3 --type message --now 2018-01-08T12:30:00Z"
    )]
    Plan(cmd::plan::PlanArgs),

    #[command(
        about = "List current archives for one org",
        after_help = "EXAMPLES:\n    # Month archives for runs\n    archiver list --org 3 --type run --period month\n\n    # Machine-readable\n    archiver list --org 3 --json"
    )]
    List(cmd::list::ListArgs),

    #[command(
        about = "Retry pending source purges",
        after_help = "EXAMPLES:\n    # Retry purges left over from failed runs\n    archiver purge"
    )]
    Purge(cmd::purge::PurgeArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("ARCHIVER_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "archiver=debug,archiver_core=debug,info"
        } else {
            "archiver=info,archiver_core=info,warn"
        })
    });

    let format = env::var("ARCHIVER_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Config file (explicit or default location) plus `ARCHIVER_*` overrides.
fn load_settings(explicit: Option<&Path>) -> anyhow::Result<ArchiverConfig> {
    let mut config = match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("config file {} not found", path.display());
            }
            load_config(path)?
        }
        None => match default_config_path() {
            Some(path) => load_config(&path)?,
            None => ArchiverConfig::default(),
        },
    };
    apply_env_overrides(&mut config, |key| env::var(key).ok())
        .context("Invalid ARCHIVER_* environment override")?;
    debug!(?config, "configuration loaded");
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let output = output::resolve_output_mode(cli.format, cli.json);

    let command_result = load_settings(cli.config.as_deref()).and_then(|config| match &cli.command {
        Commands::Init(args) => cmd::init::run_init(args, &config, output),
        Commands::Run(args) => cmd::run::run_run(args, &config, output),
        Commands::Plan(args) => cmd::plan::run_plan(args, &config, output),
        Commands::List(args) => cmd::list::run_list(args, &config, output),
        Commands::Purge(args) => cmd::purge::run_purge(args, &config, output),
    });

    if let Err(err) = command_result {
        output::render_error(output, &CliError::from(&err))?;
        std::process::exit(1);
    }
    Ok(())
}
