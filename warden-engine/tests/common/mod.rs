#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_stream::StreamExt;
use uuid::Uuid;
use warden_core::domain::event::{EventType, JobEvent};
use warden_core::domain::job::Job;
use warden_core::domain::policy::SecurityPolicy;
use warden_engine::notifier::RecordingNotifier;
use warden_engine::registry::ProcessRegistry;
use warden_engine::repository::{JobStore, SqliteJobStore};
use warden_engine::sandbox::Sandbox;
use warden_engine::{EngineConfig, JobService, db};

pub const POLICY: &str = r#"
runner: host
shell: [/bin/sh, -c]
env_allowlist: [PATH, GREETING]
"#;

pub struct Harness {
    pub service: JobService,
    pub store: Arc<SqliteJobStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub project: PathBuf,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_policy(POLICY).await
    }

    pub async fn with_policy(policy: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("site");
        std::fs::create_dir(&project).unwrap();

        let pool = db::create_memory_pool().await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let store = Arc::new(SqliteJobStore::new(pool));

        let mut config = EngineConfig::new("sqlite::memory:".to_string(), dir.path().to_path_buf());
        config.kill_grace = Duration::from_millis(500);
        config.deploy_root = dir.path().join("deploy");

        let policy: Arc<SecurityPolicy> = Arc::new(serde_yaml::from_str(policy).unwrap());
        let notifier = RecordingNotifier::new();
        let sandbox = Sandbox::from_policy(&policy, Arc::new(ProcessRegistry::new()));
        let service = JobService::with_parts(config, policy, store.clone(), sandbox, notifier.clone());

        Self {
            service,
            store,
            notifier,
            project,
            _dir: dir,
        }
    }

    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.project.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.project.join(relative)
    }

    /// Follows the job to its end and returns every event
    pub async fn events(&self, job_id: Uuid) -> Vec<JobEvent> {
        let stream = self.service.subscribe_events(job_id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(20), stream.collect::<Vec<_>>())
            .await
            .expect("job did not finish in time")
    }

    pub async fn stored_events(&self, job_id: Uuid) -> Vec<JobEvent> {
        self.store.list_events(job_id, 0).await.unwrap()
    }

    pub async fn job(&self, job_id: Uuid) -> Job {
        self.service.get_job(job_id).await.unwrap()
    }

    /// Polls until the job has a recorded pid
    pub async fn wait_for_pid(&self, job_id: Uuid) {
        for _ in 0..250 {
            if self.job(job_id).await.pid.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} never recorded a pid", job_id);
    }

    /// Polls until the named step has started
    pub async fn wait_for_stage(&self, job_id: Uuid, name: &str) {
        for _ in 0..250 {
            if stages(&self.stored_events(job_id).await, "start").iter().any(|s| s == name) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} never started step {}", job_id, name);
    }
}

pub fn seqs(events: &[JobEvent]) -> Vec<u64> {
    events.iter().map(|e| e.seq).collect()
}

pub fn logs(events: &[JobEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.event_type == EventType::Log)
        .filter_map(|e| e.data.as_str().map(str::to_string))
        .collect()
}

pub fn progress_values(events: &[JobEvent]) -> Vec<f64> {
    events.iter().filter_map(JobEvent::progress_value).collect()
}

pub fn states(events: &[JobEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e.state_status().map(str::to_string))
        .collect()
}

pub fn stages(events: &[JobEvent], status: &str) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.event_type == EventType::Stage && e.data["status"] == status)
        .filter_map(|e| e.data["name"].as_str().map(str::to_string))
        .collect()
}

pub fn exists(path: &Path) -> bool {
    path.exists()
}
