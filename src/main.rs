//! Model Repository Manager - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use model_repo_manager::{
    ControlMode, LocalLifecycle, ManagerConfig, ModelRepositoryManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "model-repo-manager")]
#[command(about = "Model repository manager for multi-model inference serving", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model repository path (repeatable, prepended to configured paths)
    #[arg(long = "model-repository")]
    model_repositories: Vec<PathBuf>,

    /// Model control mode (none, poll, explicit)
    #[arg(long)]
    model_control_mode: Option<ControlMode>,

    /// Model to load at startup in explicit mode (repeatable)
    #[arg(long = "load-model")]
    load_models: Vec<String>,

    /// Seconds between repository polls in poll mode
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    let mut config = ManagerConfig::load(cli.config).context("Failed to load configuration")?;
    let mut repositories = cli.model_repositories;
    repositories.extend(config.repository_paths);
    config.repository_paths = repositories;
    if let Some(mode) = cli.model_control_mode {
        config.control_mode = mode;
    }
    if !cli.load_models.is_empty() {
        config.startup_models = cli.load_models;
    }
    if let Some(interval) = cli.poll_interval_secs {
        config.poll_interval_secs = interval;
    }
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        repositories = ?config.repository_paths,
        mode = %config.control_mode,
        "Starting model repository manager"
    );

    let lifecycle = Arc::new(LocalLifecycle::new());
    let manager = Arc::new(
        ModelRepositoryManager::new(&config, lifecycle)
            .context("Failed to create repository manager")?,
    );
    manager.init().await.context("Startup load failed")?;

    let ready = manager.live_model_states(true).len();
    tracing::info!(models = ready, "Startup complete");

    if config.control_mode == ControlMode::Poll {
        let mut ticker = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = manager.poll_and_update().await {
                        tracing::error!(error = %err, "Repository poll failed");
                    }
                }
                _ = signal::ctrl_c() => break,
            }
        }
    } else {
        signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    }

    tracing::info!("Shutting down");
    if let Err(err) = manager.stop_all_models().await {
        tracing::warn!(error = %err, "Failed to stop models");
    }
    if let Err(err) = manager.unload_all_models().await {
        tracing::warn!(error = %err, "Failed to unload models");
    }

    Ok(())
}
