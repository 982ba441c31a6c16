//! # Asset Vault CLI (`vault`)
//!
//! ## Usage
//!
//! ```bash
//! vault --config ./vault.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vault init` | Create the storage directories |
//! | `vault serve` | Start the HTTP server and task workers |
//! | `vault repo-hash --owner <id> --project <id>` | Print a project's repository address |
//! | `vault create-project --owner <id> --name <name>` | Provision a project and wait for it |

use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use asset_vault::app::{init_storage, Vault};
use asset_vault::config::load_config;
use asset_vault::core::naming::{repo_hash, repo_relative_path};
use asset_vault::core::task::TaskStatus;
use asset_vault::server::run_server;

/// Asset Vault: resumable uploads committed into per-project Git repositories.
#[derive(Parser)]
#[command(name = "vault", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vault.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the repositories, staging, and work directories.
    Init,

    /// Start the HTTP server and task workers.
    Serve,

    /// Print the repository hash and relative path for an owner/project pair.
    RepoHash {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        project: String,
    },

    /// Provision a new project and wait for its repository.
    CreateProject {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    // Commands that don't require config
    if let Commands::RepoHash { owner, project } = &cli.command {
        let hash = repo_hash(owner, project);
        println!("{}", hash);
        println!("{}", repo_relative_path(&hash).display());
        return Ok(());
    }

    let cfg = load_config(&cli.config)?;
    tracing::info!(config = %cli.config.display(), "configuration loaded");

    match cli.command {
        Commands::Init => {
            init_storage(&cfg).await?;
            println!("Storage initialized under {}.", cfg.storage.repos_root.display());
        }
        Commands::Serve => {
            run_server(&cfg).await?;
        }
        Commands::CreateProject { owner, name } => {
            let vault = Vault::build(cfg).await?;
            let ticket = vault.provisioner.create_project(&owner, &name).await?;
            let Some(task) = vault.queue.wait_for(&ticket.task_id).await? else {
                bail!("task {} disappeared before finishing", ticket.task_id);
            };
            println!("{}", serde_json::to_string_pretty(&task)?);
            if task.status != TaskStatus::Success {
                bail!("project creation failed");
            }
        }
        Commands::RepoHash { .. } => {}
    }

    Ok(())
}
