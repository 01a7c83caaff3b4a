//! TabletFS CLI - inspect and format the local filesystem layout of a node
//!
//! Roots come from a TOML config file, overridden by command line flags
//! or environment variables.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::Path;
use tabletfs_common::{BlockManagerType, FsManagerOptions};
use tabletfs_storage::FsManager;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tabletfs-cli")]
#[command(about = "TabletFS local filesystem tool")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/tabletfs/fs.toml")]
    config: String,

    /// Root holding the write-ahead logs
    #[arg(long, env = "TABLETFS_WAL_ROOT")]
    fs_wal_root: Option<String>,

    /// Comma-separated list of data roots
    #[arg(long, env = "TABLETFS_DATA_ROOTS")]
    fs_data_roots: Option<String>,

    /// Root holding tablet and consensus metadata
    #[arg(long, env = "TABLETFS_METADATA_ROOT")]
    fs_metadata_root: Option<String>,

    /// Block manager: 'file' or 'log'
    #[arg(long, env = "TABLETFS_BLOCK_MANAGER")]
    block_manager: Option<BlockManagerType>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a fresh filesystem layout under empty roots
    Format {
        /// Use this uuid instead of generating one
        #[arg(long)]
        uuid: Option<String>,
    },
    /// Open the filesystem read-only and print the block manager report
    Check,
    /// Print the directory tree under every root
    Dump,
    /// Print the node uuid
    Uuid,
    /// List tablets with a metadata file
    ListTablets,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    fs: FsManagerOptions,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn load_config(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let config_str =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    toml::from_str(&config_str).with_context(|| format!("failed to parse {path}"))
}

/// Merge command line flags over the config file (flags take precedence)
fn merge_options(args: &Args, mut opts: FsManagerOptions, read_only: bool) -> FsManagerOptions {
    if let Some(wal_root) = &args.fs_wal_root {
        opts.wal_root.clone_from(wal_root);
    }
    if let Some(data_roots) = &args.fs_data_roots {
        opts.data_roots = FsManagerOptions::parse_data_roots(data_roots);
    }
    if let Some(metadata_root) = &args.fs_metadata_root {
        opts.metadata_root = Some(metadata_root.clone());
    }
    if let Some(block_manager) = args.block_manager {
        opts.block_manager = block_manager;
    }
    opts.read_only = read_only;
    opts
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    let log_level = if args.log_level == "info" {
        config.logging.level.clone()
    } else {
        args.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let read_only = !matches!(args.command, Commands::Format { .. });
    let opts = merge_options(&args, config.fs, read_only);
    if opts.wal_root.is_empty() {
        bail!("no WAL root configured; pass --fs-wal-root or set it in {}", args.config);
    }
    let mut fs = FsManager::new(opts).context("invalid filesystem options")?;

    match args.command {
        Commands::Format { uuid } => {
            fs.create_initial_layout(uuid.as_deref())
                .context("failed to format filesystem")?;
            let metadata = fs
                .instance_metadata()
                .context("formatted filesystem has no identity")?;
            info!("Formatted filesystem with uuid {}", metadata.uuid);
            println!("{}", metadata.uuid);
            println!("{}", metadata.format_stamp);
        }
        Commands::Check => {
            let report = fs.open().context("failed to open filesystem")?;
            println!("uuid: {}", fs.uuid().unwrap_or("<unknown>"));
            print!("{report}");
            if !report.is_clean() {
                bail!("found {} anomalies", report.anomalies.len());
            }
        }
        Commands::Dump => {
            fs.init().context("invalid filesystem roots")?;
            fs.dump_file_system_tree(&mut std::io::stdout().lock())
                .context("failed to dump filesystem tree")?;
        }
        Commands::Uuid => {
            fs.open().context("failed to open filesystem")?;
            println!("{}", fs.uuid().unwrap_or("<unknown>"));
        }
        Commands::ListTablets => {
            fs.init().context("invalid filesystem roots")?;
            for tablet_id in fs.list_tablet_ids()? {
                println!("{tablet_id}");
            }
        }
    }

    Ok(())
}
