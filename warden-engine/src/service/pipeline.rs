//! Pipeline Orchestrator
//!
//! Runs a job's steps in order. Each step is snapshotted, launched in the
//! sandbox, streamed through the progress/stage parser and write-gated
//! after exit. Job progress is the weighted sum of completed steps plus
//! the running step's own fraction, and never decreases.
//!
//! A failed step marks the job `error` straight away. Under
//! `on_error: continue` the remaining steps still run; otherwise the job
//! stops there.
//!
//! Cancellation is observed through the store: once the row is canceled
//! or otherwise finished the orchestrator stops launching steps and emits
//! nothing further for the job.

use super::journal::Journal;
use crate::gate::{TreeSnapshot, WriteGate};
use crate::notifier::{DeviceSignal, Notifier};
use crate::protocol::{ProgressTracker, parse_progress, parse_stage};
use crate::repository::StoreError;
use crate::sandbox::{CommandLine, ExecutionSpec, Sandbox, StepContext};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warden_core::domain::job::JobStatus;
use warden_core::domain::pipeline::{OnError, PipelineStep};
use warden_core::domain::policy::SecurityPolicy;
use warden_core::dto::job::JobPatch;

/// One step ready to run, with its normalised weight (0..=100)
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub step: PipelineStep,
    pub command: CommandLine,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct JobPlan {
    pub job_id: Uuid,
    pub workdir: PathBuf,
    pub env: HashMap<String, String>,
    pub on_error: OnError,
    pub steps: Vec<PlannedStep>,
}

enum StepOutcome {
    Passed,
    Failed { exit_code: i32 },
    /// The job went terminal while the step ran
    Aborted,
}

/// Running progress accounting for one job
struct Progress {
    /// Sum of completed step weights, 0..=100
    base: f64,
    /// Last persisted job-level value, 0..=1
    reported: f64,
}

impl Progress {
    fn job_value(&self, weight: f64, step_fraction: f64) -> f64 {
        ((self.base + weight * step_fraction) / 100.0).clamp(0.0, 1.0)
    }
}

pub struct PipelineRunner {
    policy: Arc<SecurityPolicy>,
    journal: Arc<Journal>,
    sandbox: Arc<Sandbox>,
    notifier: Arc<dyn Notifier>,
    kill_grace: Duration,
    /// Errored jobs still running `on_error: continue` steps
    continuing: Mutex<HashSet<Uuid>>,
}

impl PipelineRunner {
    pub fn new(
        policy: Arc<SecurityPolicy>,
        journal: Arc<Journal>,
        sandbox: Arc<Sandbox>,
        notifier: Arc<dyn Notifier>,
        kill_grace: Duration,
    ) -> Self {
        Self {
            policy,
            journal,
            sandbox,
            notifier,
            kill_grace,
            continuing: Mutex::new(HashSet::new()),
        }
    }

    fn continuing(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.continuing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether an errored job is still working through its remaining steps
    pub fn is_continuing(&self, job_id: Uuid) -> bool {
        self.continuing().contains(&job_id)
    }

    /// Skips the remaining steps of an errored job
    ///
    /// Returns false when the job was not continuing past a failure.
    pub fn halt(&self, job_id: Uuid) -> bool {
        self.continuing().remove(&job_id)
    }

    /// Whether the job should keep executing steps
    async fn active(&self, job_id: Uuid) -> Result<bool, StoreError> {
        Ok(match self.journal.status(job_id).await? {
            Some(JobStatus::Running) => true,
            Some(JobStatus::Error) => self.is_continuing(job_id),
            _ => false,
        })
    }

    /// Drives the job to a terminal state and closes its live channel
    pub async fn run(&self, plan: JobPlan) {
        let job_id = plan.job_id;

        if let Err(e) = self.execute(&plan).await {
            error!("Job {} aborted: {}", job_id, e);
            let _ = self.journal.log(job_id, format!("[error] {}", e)).await;
            match self
                .journal
                .apply(job_id, JobPatch::finish(JobStatus::Error, None, None))
                .await
            {
                Ok(true) => self.notifier.notify(DeviceSignal::failure()),
                Ok(false) => {}
                Err(e) => error!("Failed to record failure of job {}: {}", job_id, e),
            }
        }

        self.halt(job_id);
        self.journal.close(job_id);
    }

    async fn execute(&self, plan: &JobPlan) -> Result<(), StoreError> {
        let job_id = plan.job_id;
        let total = plan.steps.len();
        let mut progress = Progress {
            base: 0.0,
            reported: 0.0,
        };
        let mut failure: Option<i32> = None;
        let mut last_exit: Option<i32> = None;

        for (index, planned) in plan.steps.iter().enumerate() {
            if !self.active(job_id).await? {
                debug!("Job {} no longer running, skipping remaining steps", job_id);
                return Ok(());
            }

            let name = planned.step.display_name(index);
            info!("Job {} step {}/{}: {}", job_id, index + 1, total, name);
            self.journal
                .stage(
                    job_id,
                    json!({"name": name, "index": index + 1, "total": total, "status": "start"}),
                )
                .await?;
            self.notifier
                .notify(DeviceSignal::progress(progress.base, 180));

            match self.run_step(plan, index, planned, &mut progress).await? {
                StepOutcome::Aborted => return Ok(()),
                StepOutcome::Passed => {
                    last_exit = Some(0);
                    progress.base += planned.weight;
                    self.journal
                        .stage(
                            job_id,
                            json!({"name": name, "index": index + 1, "total": total, "status": "ok"}),
                        )
                        .await?;
                    let value = progress.job_value(0.0, 0.0);
                    self.report(job_id, &mut progress, value).await?;
                }
                StepOutcome::Failed { exit_code } => {
                    last_exit = Some(exit_code);
                    self.journal
                        .stage(
                            job_id,
                            json!({
                                "name": name,
                                "index": index + 1,
                                "total": total,
                                "status": "error",
                                "exit": exit_code,
                            }),
                        )
                        .await?;

                    failure.get_or_insert(exit_code);
                    if plan.on_error == OnError::Continue {
                        self.continuing().insert(job_id);
                    }
                    self.record_failure(job_id, exit_code).await?;
                    match plan.on_error {
                        OnError::Stop => break,
                        OnError::Continue => {
                            warn!("Job {} step {} failed, continuing", job_id, name);
                        }
                    }
                }
            }
        }

        if !self.active(job_id).await? {
            return Ok(());
        }

        match failure {
            None => {
                let finishing = (progress.reported < 1.0).then_some(1.0);
                if self
                    .journal
                    .apply(job_id, JobPatch::finish(JobStatus::Ok, last_exit, finishing))
                    .await?
                {
                    info!("Job {} finished ok", job_id);
                    self.notifier.notify(DeviceSignal::success());
                }
            }
            Some(exit_code) => {
                info!("Job {} finished with error (exit {})", job_id, exit_code);
            }
        }
        Ok(())
    }

    /// Marks the job errored, or refreshes the exit code of one that already is
    async fn record_failure(&self, job_id: Uuid, exit_code: i32) -> Result<(), StoreError> {
        if self
            .journal
            .apply(job_id, JobPatch::finish(JobStatus::Error, Some(exit_code), None))
            .await?
        {
            self.notifier.notify(DeviceSignal::failure());
            return Ok(());
        }

        self.journal
            .apply(
                job_id,
                JobPatch {
                    exit_code: Some(exit_code),
                    finished_at: Some(chrono::Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn run_step(
        &self,
        plan: &JobPlan,
        index: usize,
        planned: &PlannedStep,
        progress: &mut Progress,
    ) -> Result<StepOutcome, StoreError> {
        let job_id = plan.job_id;
        let name = planned.step.display_name(index);
        let before = snapshot(&plan.workdir).await;

        let spec = ExecutionSpec::build(
            &self.policy,
            &planned.step,
            &planned.command,
            StepContext {
                job_id,
                step_index: index,
                workdir: &plan.workdir,
                env: &plan.env,
            },
        );

        let mut execution = match self.sandbox.launch(job_id, &spec).await {
            Ok(execution) => execution,
            Err(e) => {
                warn!("Job {} step {} failed to launch: {}", job_id, name, e);
                self.journal
                    .log(job_id, format!("[error] failed to launch step {}: {}", name, e))
                    .await?;
                return Ok(StepOutcome::Failed { exit_code: 127 });
            }
        };

        if let Some(pid) = execution.pid() {
            self.journal.apply(job_id, JobPatch::pid(pid)).await?;
        }
        // A cancel that raced the launch found nothing to stop
        if !self.active(job_id).await? {
            self.sandbox.registry().terminate(job_id, self.kill_grace);
        }

        let mut tracker = ProgressTracker::new();
        while let Some(line) = execution.next_line().await {
            self.journal.log(job_id, line.as_str()).await?;

            if let Some(fraction) = parse_progress(&line).and_then(|v| tracker.observe(v)) {
                let value = progress.job_value(planned.weight, fraction);
                if self.report(job_id, progress, value).await? {
                    self.notifier
                        .notify(DeviceSignal::progress(value * 100.0, 90));
                }
            }
            if let Some(marker) = parse_stage(&line) {
                self.journal.stage(job_id, marker.to_event_data()).await?;
            }
        }

        let exit_code = execution.finish().await;
        debug!("Job {} step {} exited with {}", job_id, name, exit_code);

        if !self.active(job_id).await? {
            return Ok(StepOutcome::Aborted);
        }

        let mut gate_passed = true;
        if exit_code == 0 {
            let after = snapshot(&plan.workdir).await;
            let patterns = if planned.step.writes.is_empty() {
                self.policy.allowed_writes()
            } else {
                planned.step.writes.clone()
            };
            let gate = WriteGate::new(patterns);
            let verdict = gate.evaluate(&before, &after);

            if !verdict.passed() {
                warn!(
                    "Job {} step {} wrote outside its allow-list: {:?}",
                    job_id, name, verdict.denied
                );
                self.journal
                    .log(job_id, gate.violation_message(&verdict))
                    .await?;
                gate_passed = false;
            }
        }

        let suffix = if gate_passed { "" } else { " (writes-denied)" };
        self.journal
            .log(job_id, format!("[exit {}]{}", exit_code, suffix))
            .await?;

        if exit_code == 0 && gate_passed {
            Ok(StepOutcome::Passed)
        } else {
            Ok(StepOutcome::Failed { exit_code })
        }
    }

    /// Persists `value` if it moves job progress forward
    async fn report(
        &self,
        job_id: Uuid,
        progress: &mut Progress,
        value: f64,
    ) -> Result<bool, StoreError> {
        if value <= progress.reported {
            return Ok(false);
        }
        progress.reported = value;
        self.journal.apply(job_id, JobPatch::progress(value)).await
    }
}

async fn snapshot(root: &Path) -> TreeSnapshot {
    let root = root.to_path_buf();
    match tokio::task::spawn_blocking(move || TreeSnapshot::capture(&root)).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!("Snapshot task failed: {}", e);
            TreeSnapshot::default()
        }
    }
}
