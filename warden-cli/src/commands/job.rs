//! Job command handlers

use anyhow::{Context, Result};
use colored::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_stream::StreamExt;
use uuid::Uuid;
use warden_core::domain::job::{JobKind, JobStatus};
use warden_core::dto::job::StartJob;
use warden_engine::JobService;

use crate::display::{print_event, print_job_details, print_job_summary};

pub struct RunRequest {
    pub project: String,
    pub kind: JobKind,
    pub pipeline: Option<PathBuf>,
    pub script: Option<String>,
    pub env: HashMap<String, String>,
    pub command: Vec<String>,
}

/// Starts a job, streams its events and cancels it on Ctrl-C
pub async fn run(service: &JobService, request: RunRequest) -> Result<ExitCode> {
    let mut command = request.command.into_iter();
    let start = StartJob {
        project: request.project,
        kind: request.kind,
        cmd: command.next(),
        args: command.collect(),
        env: request.env,
        script: request.script,
        pipeline_ref: request
            .pipeline
            .map(|p| p.to_string_lossy().into_owned()),
    };

    let job_id = service.start_job(start).await?;
    println!("{} {}", "Started job".bold(), job_id.to_string().cyan());

    let mut events = service.subscribe_events(job_id).await?;
    let mut cancel_sent = false;

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                eprintln!("{}", "Canceling job...".yellow());
                service.cancel_job(job_id).await?;
                cancel_sent = true;
            }
        }
    }

    let job = service.get_job(job_id).await?;
    print_job_details(&job);

    Ok(match job.status {
        JobStatus::Ok => ExitCode::SUCCESS,
        JobStatus::Canceled => ExitCode::from(130),
        JobStatus::Error | JobStatus::Running => {
            let code = job.exit_code.unwrap_or(1).clamp(1, 255);
            ExitCode::from(code as u8)
        }
    })
}

pub async fn list(service: &JobService, project: Option<&str>) -> Result<ExitCode> {
    let jobs = service.list_jobs(project).await?;

    if jobs.is_empty() {
        println!("{}", "No jobs found.".yellow());
    } else {
        println!("{}", format!("Found {} job(s):", jobs.len()).bold());
        println!();
        for job in jobs {
            print_job_summary(&job);
        }
    }

    Ok(ExitCode::SUCCESS)
}

pub async fn show(service: &JobService, id: &str) -> Result<ExitCode> {
    let job = service.get_job(parse_id(id)?).await?;
    print_job_details(&job);
    Ok(ExitCode::SUCCESS)
}

pub async fn events(service: &JobService, id: &str) -> Result<ExitCode> {
    let mut events = service.subscribe_events(parse_id(id)?).await?;
    while let Some(event) = events.next().await {
        print_event(&event);
    }
    Ok(ExitCode::SUCCESS)
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("Invalid job id '{}'", id))
}
