//! Job DTOs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::job::{JobKind, JobStatus};

/// Request to start a new job against a project's working tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartJob {
    pub project: String,
    #[serde(default)]
    pub kind: JobKind,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Shell script for `custom` jobs without an explicit command
    #[serde(default)]
    pub script: Option<String>,
    /// Pipeline file relative to the project root
    #[serde(default)]
    pub pipeline_ref: Option<String>,
}

/// Partial update of a job row; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub exit_code: Option<i32>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub pid: Option<u32>,
}

impl JobPatch {
    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn pid(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            ..Default::default()
        }
    }

    /// Terminal transition stamped with the current time
    pub fn finish(status: JobStatus, exit_code: Option<i32>, progress: Option<f64>) -> Self {
        Self {
            status: Some(status),
            progress,
            exit_code,
            finished_at: Some(chrono::Utc::now()),
            pid: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Job listing filter, most recent first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub project_id: Option<String>,
    pub limit: Option<u32>,
}
