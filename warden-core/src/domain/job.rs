//! Job domain types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Job execution record
///
/// Created when a start request is accepted. Only the engine's execution path
/// mutates it afterwards; it is never deleted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub project_id: String,
    pub kind: JobKind,
    pub cmd: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub status: JobStatus,
    /// Fraction of work completed, in [0, 1]
    pub progress: f64,
    pub exit_code: Option<i32>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub pid: Option<u32>,
}

impl Job {
    /// Builds the initial `running` record for an accepted start request
    pub fn new(
        project_id: String,
        kind: JobKind,
        cmd: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            project_id,
            kind,
            cmd,
            args,
            env,
            status: JobStatus::Running,
            progress: 0.0,
            exit_code: None,
            started_at: chrono::Utc::now(),
            finished_at: None,
            pid: None,
        }
    }
}

/// What a job was started to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Deploy,
    Test,
    Build,
    Pipeline,
    #[default]
    Custom,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Deploy => "deploy",
            JobKind::Test => "test",
            JobKind::Build => "build",
            JobKind::Pipeline => "pipeline",
            JobKind::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deploy" => Some(JobKind::Deploy),
            "test" => Some(JobKind::Test),
            "build" => Some(JobKind::Build),
            "pipeline" => Some(JobKind::Pipeline),
            "custom" => Some(JobKind::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job execution status
///
/// `Running` is the only non-terminal state; the others are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Ok,
    Error,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Ok => "ok",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(JobStatus::Running),
            "ok" => Some(JobStatus::Ok),
            "error" => Some(JobStatus::Error),
            "canceled" => Some(JobStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_running_with_zero_progress() {
        let job = Job::new(
            "site".to_string(),
            JobKind::Build,
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "true".to_string()],
            HashMap::new(),
        );

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress, 0.0);
        assert!(job.finished_at.is_none());
        assert!(job.exit_code.is_none());
    }

    #[test]
    fn test_status_names_round_trip() {
        for status in [
            JobStatus::Running,
            JobStatus::Ok,
            JobStatus::Error,
            JobStatus::Canceled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("cancelled"), None);
    }

    #[test]
    fn test_only_running_is_non_terminal() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Ok.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_string(&JobKind::Pipeline).unwrap();
        assert_eq!(json, "\"pipeline\"");
        assert_eq!(JobKind::default(), JobKind::Custom);
    }
}
