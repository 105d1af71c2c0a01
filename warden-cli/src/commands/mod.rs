//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod job;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;
use std::process::ExitCode;
use warden_core::domain::job::JobKind;
use warden_engine::JobService;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start a job and follow it until it finishes
    Run {
        /// Project directory name under the projects dir
        project: String,

        /// Job kind: deploy, test, build, pipeline or custom
        #[arg(short, long, default_value = "custom", value_parser = parse_kind)]
        kind: JobKind,

        /// Pipeline file relative to the project (pipeline jobs)
        #[arg(short, long)]
        pipeline: Option<PathBuf>,

        /// Shell script for custom jobs
        #[arg(short, long)]
        script: Option<String>,

        /// Extra environment, filtered by the policy allow-list
        #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
        env: Vec<(String, String)>,

        /// Command and arguments to run
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// List recent jobs
    Jobs {
        /// Only jobs of this project
        #[arg(short, long)]
        project: Option<String>,
    },
    /// Show job details
    Show {
        /// Job ID
        id: String,
    },
    /// Print a job's event log
    Events {
        /// Job ID
        id: String,
    },
}

/// Handle a CLI command
pub async fn handle_command(command: Commands, service: &JobService) -> Result<ExitCode> {
    match command {
        Commands::Run {
            project,
            kind,
            pipeline,
            script,
            env,
            command,
        } => {
            let request = job::RunRequest {
                project,
                kind,
                pipeline,
                script,
                env: env.into_iter().collect(),
                command,
            };
            job::run(service, request).await
        }
        Commands::Jobs { project } => job::list(service, project.as_deref()).await,
        Commands::Show { id } => job::show(service, &id).await,
        Commands::Events { id } => job::events(service, &id).await,
    }
}

fn parse_kind(raw: &str) -> Result<JobKind, String> {
    JobKind::parse(&raw.to_lowercase()).ok_or_else(|| format!("unknown job kind '{}'", raw))
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        assert_eq!(
            parse_env("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_env("novalue").is_err());
        assert!(parse_env("=x").is_err());
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!(parse_kind("Deploy").unwrap(), JobKind::Deploy);
        assert!(parse_kind("nope").is_err());
    }
}
