use std::process;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use strata_core::{Config, StrataError};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Stage pipeline build engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a pipeline definition
    Build {
        /// Pipeline file, or a directory containing a Stagefile
        #[arg(default_value = ".")]
        path: String,

        /// Pipeline arguments (NAME=VALUE)
        #[arg(long = "arg", value_name = "NAME=VALUE")]
        arg: Vec<String>,

        /// Stage to build instead of the last one
        #[arg(short, long)]
        target: Option<String>,

        /// Ignore stored snapshots and rebuild every stage
        #[arg(long)]
        no_cache: bool,

        /// Allow an image without an entrypoint or cmd
        #[arg(long)]
        no_entry_check: bool,

        /// Also export the built image as a gzipped tarball
        #[arg(short, long, value_name = "PATH")]
        output: Option<String>,
    },

    /// List registered images
    Images,

    /// Inspect and maintain the snapshot store
    #[command(subcommand)]
    Cache(CacheCommands),

    /// Export a registered image as a gzipped tarball
    Export {
        /// Image id, or a unique prefix of one
        image: String,

        /// Output path
        #[arg(short, long, value_name = "PATH")]
        output: String,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show snapshot and blob usage
    Stats,

    /// Delete every stored snapshot and blob
    Clear,

    /// Remove one snapshot by fingerprint
    Rm {
        /// Full snapshot fingerprint
        fingerprint: String,
    },

    /// Drop oldest snapshots until blob usage fits the limit
    Prune {
        /// Upper bound on stored blob bytes
        #[arg(long, value_name = "BYTES")]
        max_size: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let result = run(cli).await;
    if let Err(err) = result {
        eprintln!("{} {:#}", "error:".red().bold(), err);
        process::exit(exit_code(&err));
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Build { path, arg, target, no_cache, no_entry_check, output } => {
            commands::build(path, arg, target, no_cache, no_entry_check, output).await
        }
        Commands::Images => commands::images(),
        Commands::Cache(command) => match command {
            CacheCommands::Stats => commands::cache_stats(),
            CacheCommands::Clear => commands::cache_clear(),
            CacheCommands::Rm { fingerprint } => commands::cache_rm(&fingerprint),
            CacheCommands::Prune { max_size } => commands::cache_prune(max_size),
        },
        Commands::Export { image, output } => commands::export(&image, &output),
    }
}

/// Filter from RUST_LOG when set, otherwise from the configured level.
fn init_logging() {
    let level = Config::load().map(|c| c.log_level).unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Definition and resolution problems exit with 2, runtime failures
/// with 1.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<StrataError>() {
        Some(err) => err.kind().exit_code(),
        None => 1,
    }
}
