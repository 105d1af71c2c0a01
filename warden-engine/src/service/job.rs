//! Job Service
//!
//! Entry points for starting, inspecting, canceling and following jobs.

use super::feed;
use super::journal::Journal;
use super::pipeline::{JobPlan, PipelineRunner};
use super::resolve;
use crate::broadcast::EventBroadcaster;
use crate::config::EngineConfig;
use crate::notifier::{DeviceSignal, NoopNotifier, Notifier};
use crate::registry::ProcessRegistry;
use crate::repository::{JobStore, StoreError};
use crate::sandbox::Sandbox;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;
use warden_core::domain::event::{EventType, JobEvent};
use warden_core::domain::job::{Job, JobStatus};
use warden_core::domain::policy::SecurityPolicy;
use warden_core::dto::job::{JobFilter, JobPatch, StartJob};

/// Service error type
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct JobService {
    config: Arc<EngineConfig>,
    policy: Arc<SecurityPolicy>,
    journal: Arc<Journal>,
    sandbox: Arc<Sandbox>,
    runner: Arc<PipelineRunner>,
    notifier: Arc<dyn Notifier>,
}

impl JobService {
    /// Service with policy-selected backends and no device notifications
    pub fn new(config: EngineConfig, policy: Arc<SecurityPolicy>, store: Arc<dyn JobStore>) -> Self {
        let sandbox = Sandbox::from_policy(&policy, Arc::new(ProcessRegistry::new()));
        Self::with_parts(config, policy, store, sandbox, Arc::new(NoopNotifier))
    }

    pub fn with_parts(
        config: EngineConfig,
        policy: Arc<SecurityPolicy>,
        store: Arc<dyn JobStore>,
        sandbox: Sandbox,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let broadcaster = Arc::new(EventBroadcaster::new(config.event_buffer));
        let journal = Arc::new(Journal::new(store, broadcaster));
        let sandbox = Arc::new(sandbox);
        let runner = Arc::new(PipelineRunner::new(
            policy.clone(),
            journal.clone(),
            sandbox.clone(),
            notifier.clone(),
            config.kill_grace,
        ));

        Self {
            config: Arc::new(config),
            policy,
            journal,
            sandbox,
            runner,
            notifier,
        }
    }

    /// Replaces the notifier
    pub fn with_notifier(self, notifier: Arc<dyn Notifier>) -> Self {
        let runner = Arc::new(PipelineRunner::new(
            self.policy.clone(),
            self.journal.clone(),
            self.sandbox.clone(),
            notifier.clone(),
            self.config.kill_grace,
        ));
        Self {
            runner,
            notifier,
            ..self
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates and persists the job, then runs it in the background
    ///
    /// Configuration problems (unknown project, malformed pipeline, missing
    /// command) are reported here, before anything is spawned.
    pub async fn start_job(&self, req: StartJob) -> Result<Uuid, JobError> {
        let (project, root) = resolve::project_root(&self.config.projects_dir, &req.project)?;
        let resolution =
            resolve::resolve(&req, &project, &root, &self.config.deploy_root, &self.policy).await?;

        let job = Job::new(
            project.clone(),
            req.kind,
            resolution.cmd,
            resolution.args,
            req.env.clone(),
        );
        let job_id = job.job_id;

        self.journal.store().insert(&job).await?;
        self.journal.broadcaster().open(job_id);
        self.journal
            .record(
                job_id,
                EventType::State,
                json!({"status": JobStatus::Running, "project": project, "kind": req.kind}),
            )
            .await?;

        tracing::info!(
            "Job {} started: {} {} ({} steps)",
            job_id,
            req.kind,
            project,
            resolution.steps.len()
        );
        self.notifier.notify(DeviceSignal::progress(5.0, 180));

        let plan = JobPlan {
            job_id,
            workdir: root,
            env: resolution.env,
            on_error: resolution.on_error,
            steps: resolution.steps,
        };
        let runner = self.runner.clone();
        tokio::spawn(async move { runner.run(plan).await });

        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job, JobError> {
        self.journal
            .store()
            .get(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    /// Most recent first, bounded by the configured page size
    pub async fn list_jobs(&self, project_id: Option<&str>) -> Result<Vec<Job>, JobError> {
        let filter = JobFilter {
            project_id: project_id.map(resolve::sanitize_project),
            limit: Some(self.config.list_limit),
        };
        Ok(self.journal.store().list(&filter).await?)
    }

    /// Cancels a running job; unknown or finished jobs are left alone
    ///
    /// The status is persisted before the process is signalled, and the
    /// shutdown itself runs in the background. A job that already errored
    /// under `on_error: continue` keeps its `error` status and skips its
    /// remaining steps.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<(), JobError> {
        let continuing = match self.journal.status(job_id).await? {
            Some(JobStatus::Running) => false,
            Some(JobStatus::Error) if self.runner.is_continuing(job_id) => true,
            _ => {
                tracing::debug!("Cancel of job {} ignored: not running", job_id);
                return Ok(());
            }
        };

        // Logged first so it lands before the job's channel closes
        self.journal.log(job_id, "[cancel requested]").await?;

        if continuing {
            // Already errored; only the remaining steps are dropped
            if self.runner.halt(job_id) {
                tracing::info!("Job {} halted after earlier failure", job_id);
            }
        } else if self
            .journal
            .apply(job_id, JobPatch::finish(JobStatus::Canceled, None, None))
            .await?
        {
            tracing::info!("Job {} canceled", job_id);
        } else if self.runner.halt(job_id) {
            tracing::info!("Job {} halted after earlier failure", job_id);
        } else {
            tracing::debug!("Job {} finished before the cancel applied", job_id);
            return Ok(());
        }

        self.sandbox
            .registry()
            .terminate(job_id, self.config.kill_grace);
        Ok(())
    }

    /// Replays persisted events, then follows live ones until the job ends
    ///
    /// Dropping the stream unsubscribes without affecting the job.
    pub async fn subscribe_events(&self, job_id: Uuid) -> Result<ReceiverStream<JobEvent>, JobError> {
        if self.journal.store().get(job_id).await?.is_none() {
            return Err(JobError::NotFound(job_id));
        }

        Ok(feed::subscribe(
            self.journal.store().clone(),
            self.journal.broadcaster(),
            job_id,
            self.config.event_buffer,
        ))
    }
}
