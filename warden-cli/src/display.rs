//! Terminal rendering of jobs and events

use colored::*;
use warden_core::domain::event::{EventType, JobEvent};
use warden_core::domain::job::{Job, JobStatus};

pub fn print_job_summary(job: &Job) {
    println!("  {} Job {}", "▸".cyan(), job.job_id.to_string().dimmed());
    println!("    Project:  {} ({})", job.project_id, job.kind);
    println!("    Status:   {}", colorize_status(job.status));
    println!(
        "    Started:  {}",
        job.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!();
}

pub fn print_job_details(job: &Job) {
    println!();
    println!("{}", "Job Details".bold().underline());
    println!("  ID:       {}", job.job_id);
    println!("  Project:  {}", job.project_id);
    println!("  Kind:     {}", job.kind);
    println!("  Status:   {}", colorize_status(job.status));
    println!("  Progress: {:.0}%", job.progress * 100.0);
    if !job.cmd.is_empty() {
        println!("  Command:  {} {}", job.cmd, job.args.join(" "));
    }
    if let Some(code) = job.exit_code {
        println!("  Exit:     {}", code);
    }
    println!(
        "  Started:  {}",
        job.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(finished) = job.finished_at {
        println!("  Finished: {}", finished.format("%Y-%m-%d %H:%M:%S"));
        let duration = finished.signed_duration_since(job.started_at);
        println!("  Duration: {}s", duration.num_seconds());
    }
}

pub fn print_event(event: &JobEvent) {
    let seq = format!("{:>5}", event.seq).dimmed();
    match event.event_type {
        EventType::Log => {
            let line = event
                .data
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| event.data.to_string());
            if line.starts_with("[SECURITY]") || line.starts_with("[error]") {
                println!("{} {}", seq, line.red());
            } else if line.starts_with("[exit ") || line.starts_with("[cancel requested]") {
                println!("{} {}", seq, line.dimmed());
            } else {
                println!("{} {}", seq, line);
            }
        }
        EventType::State => {
            let status = event
                .state_status()
                .and_then(JobStatus::parse)
                .map(colorize_status)
                .unwrap_or_else(|| event.data.to_string().normal());
            println!("{} {} {}", seq, "state".bold(), status);
        }
        EventType::Progress => {
            let pct = event.progress_value().unwrap_or(0.0) * 100.0;
            println!("{} {} {:.0}%", seq, "progress".bold(), pct);
        }
        EventType::Stage => {
            let name = event.data["name"].as_str().unwrap_or("?");
            let status = event.data["status"].as_str().unwrap_or("?");
            let position = match (event.data["index"].as_u64(), event.data["total"].as_u64()) {
                (Some(index), Some(total)) => format!(" [{}/{}]", index, total),
                _ => String::new(),
            };
            println!("{} {} {}{} {}", seq, "stage".bold(), name.cyan(), position, status);
        }
    }
}

fn colorize_status(status: JobStatus) -> ColoredString {
    match status {
        JobStatus::Running => "running".yellow(),
        JobStatus::Ok => "ok".green(),
        JobStatus::Error => "error".red(),
        JobStatus::Canceled => "canceled".magenta(),
    }
}
