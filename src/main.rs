use anyhow::{bail, Context, Result};
use clap::Parser;
use fs2::FileExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use claude_batch::cidx::Cidx;
use claude_batch::config::ServerConfig;
use claude_batch::domain::CloneStatus;
use claude_batch::engine::Engine;
use claude_batch::repo::{RegisterRequest, RepoRegistry};

mod commands;
use commands::{Commands, RepoCommands};

#[derive(Parser)]
#[command(name = "claude-batch")]
#[command(about = "Multi-user batch execution around the Claude CLI")]
#[command(version)]
struct Cli {
    /// Path to the config file (defaults to <data_dir>/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory from the config
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[tokio::main]
async fn main() {
    // Exit code 1 is reserved for unrecoverable configuration errors;
    // subprocess exit codes live on job records, never on the server.
    if let Err(e) = run().await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => {
            let data_dir = cli
                .data_dir
                .clone()
                .unwrap_or_else(|| ServerConfig::default().data_dir);
            ServerConfig::load_or_init(&ServerConfig::default_path(&data_dir))?
        }
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Repo { command } => repo_command(config, command).await,
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

    // One server instance per data dir; the lock lives for the whole run.
    let lock_path = config.data_dir.join(".lock");
    let lock_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("Failed to open {}", lock_path.display()))?;
    if lock_file.try_lock_exclusive().is_err() {
        bail!(
            "another server instance already owns {}",
            config.data_dir.display()
        );
    }

    let engine = Engine::new(config)?;
    engine.start().await?;
    tracing::info!("claude-batch serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;
    tracing::info!("shutting down");
    engine.shutdown().await;
    Ok(())
}

async fn repo_command(config: ServerConfig, command: RepoCommands) -> Result<()> {
    let repos = Arc::new(RepoRegistry::new(
        config.repos_dir(),
        Cidx::new(&config.cidx.binary),
    )?);
    repos.scan()?;

    match command {
        RepoCommands::Register {
            name,
            url,
            description,
            cidx,
        } => {
            repos.register(RegisterRequest {
                name: name.clone(),
                git_url: url,
                description,
                cidx_aware: cidx,
            })?;
            println!("Registering {} ...", name);

            let record = repos
                .wait_settled(&name, Duration::from_secs(3600))
                .await?;
            println!("{}: {}", record.name, record.clone_status);
            if record.clone_status == CloneStatus::Failed {
                bail!("registration of {} failed (directory kept for diagnostics)", name);
            }
        }
        RepoCommands::List => {
            for repo in repos.list() {
                let dir = repos.repo_dir(&repo.name);
                let branch = if claude_batch::git::is_git_repo(&dir) {
                    claude_batch::git::current_branch(&dir)
                        .await
                        .unwrap_or_else(|_| "-".to_string())
                } else {
                    "-".to_string()
                };
                println!(
                    "{:<24} {:<10} {:<16} cidx={:<5} {}",
                    repo.name, repo.clone_status, branch, repo.cidx_aware, repo.git_url
                );
            }
        }
        RepoCommands::Unregister { name } => {
            repos.unregister(&name).await?;
            println!("Removed {}", name);
        }
    }
    Ok(())
}
