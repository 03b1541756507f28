mod cli;
mod config;
mod host_tool;
mod instance_lock;
mod launch;
mod selector;
mod store;
mod util;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cvd", about = "Create, track and tear down groups of virtual device instances")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new instance group. Arguments after `--` go to the start binary.
    Start {
        /// Name of the new group.
        #[arg(long)]
        group_name: Option<String>,
        /// Comma-separated per-instance names, one per instance.
        #[arg(long)]
        instance_name: Option<String>,
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Arguments for the start binary.
        #[arg(last = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// List instance groups and their devices (no lock needed).
    Fleet {
        /// Print the registry as JSON.
        #[arg(long)]
        json: bool,
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Find devices by field, e.g. `--field group_name=phones --field instance_id=3`.
    Find {
        /// `field=value`; fields are home, instance_id, group_name, instance_name.
        #[arg(long = "field", required = true)]
        fields: Vec<String>,
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Forget every group, release its instance ids and kill leftover processes.
    Clear {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Append the groups of a JSON snapshot to the registry.
    Import {
        /// Snapshot file with a top-level "Groups" array.
        file: PathBuf,
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Allow or forbid translating legacy acloud commands.
    Translator {
        #[arg(long, conflicts_with = "opt_in", required_unless_present = "opt_in")]
        opt_out: bool,
        #[arg(long)]
        opt_in: bool,
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Exit 0 if legacy acloud commands may be translated.
    TryAcloud {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            group_name,
            instance_name,
            config: config_path,
            args,
        } => {
            let config = cli::load_config(config_path)?;
            cli::run_start(
                &config,
                cli::StartOptions {
                    args,
                    group_name,
                    instance_names: instance_name,
                },
            )
            .await?;
        }
        Commands::Fleet { json, config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_fleet(&config, json).await?;
        }
        Commands::Find { fields, config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_find(&config, &fields).await?;
        }
        Commands::Clear { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_clear(&config).await?;
        }
        Commands::Import { file, config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_import(&config, &file).await?;
        }
        Commands::Translator {
            opt_out,
            opt_in: _,
            config: config_path,
        } => {
            let config = cli::load_config(config_path)?;
            cli::run_translator(&config, opt_out).await?;
        }
        Commands::TryAcloud { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_try_acloud(&config).await?;
        }
    }

    Ok(())
}
