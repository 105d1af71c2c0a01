//! Warden CLI
//!
//! Runs sandboxed jobs against local project trees and inspects their
//! history.

mod commands;
mod display;

use anyhow::{Context, Result};
use clap::Parser;
use commands::{Commands, handle_command};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warden_engine::notifier::{HttpNotifier, NoopNotifier, Notifier};
use warden_engine::registry::ProcessRegistry;
use warden_engine::repository::SqliteJobStore;
use warden_engine::sandbox::Sandbox;
use warden_engine::{EngineConfig, JobService, db, policy};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Sandboxed job runner", long_about = None)]
struct Cli {
    /// Job database URL
    #[arg(long, env = "WARDEN_DB_URL")]
    db: Option<String>,

    /// Directory holding one working tree per project
    #[arg(long, env = "WARDEN_PROJECTS_DIR")]
    projects_dir: Option<PathBuf>,

    /// Security policy file
    #[arg(long, env = "WARDEN_POLICY_PATH")]
    policy: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr so job output stays clean
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden=info,warden_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::from_env();
    if let Some(db) = cli.db {
        config.database_url = db;
    }
    if let Some(dir) = cli.projects_dir {
        config.projects_dir = dir;
    }
    if let Some(path) = cli.policy {
        config.policy_path = path;
    }
    config.validate().context("Invalid configuration")?;

    let service = build_service(config).await?;
    handle_command(cli.command, &service).await
}

async fn build_service(config: EngineConfig) -> Result<JobService> {
    let pool = db::create_pool(&config.database_url)
        .await
        .with_context(|| format!("Failed to open job database {}", config.database_url))?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let policy = policy::load_policy(&config.policy_path);
    info!(
        "Loaded policy: runner={}, image={}",
        policy.runner, policy.default_image
    );

    let notifier: Arc<dyn Notifier> = match &config.notify_url {
        Some(url) => Arc::new(HttpNotifier::new(url.clone(), &config.notify_key_path)),
        None => Arc::new(NoopNotifier),
    };

    let sandbox = Sandbox::from_policy(&policy, Arc::new(ProcessRegistry::new()));
    let store = Arc::new(SqliteJobStore::new(pool));

    Ok(JobService::with_parts(config, policy, store, sandbox, notifier))
}
