//! Job Journal
//!
//! Every job event goes through here: appended to the store first, then
//! published to live subscribers, so the live stream never carries an event
//! replay could miss.

use crate::broadcast::EventBroadcaster;
use crate::repository::{JobStore, StoreError};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use uuid::Uuid;
use warden_core::domain::event::{EventType, JobEvent};
use warden_core::domain::job::JobStatus;
use warden_core::dto::job::JobPatch;

pub struct Journal {
    store: Arc<dyn JobStore>,
    broadcaster: Arc<EventBroadcaster>,
}

impl Journal {
    pub fn new(store: Arc<dyn JobStore>, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self { store, broadcaster }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub async fn record(
        &self,
        job_id: Uuid,
        event_type: EventType,
        data: JsonValue,
    ) -> Result<JobEvent, StoreError> {
        let event = self.store.append_event(job_id, event_type, &data).await?;
        self.broadcaster.publish(&event);
        Ok(event)
    }

    pub async fn log(&self, job_id: Uuid, line: impl Into<String>) -> Result<JobEvent, StoreError> {
        self.record(job_id, EventType::Log, JsonValue::String(line.into())).await
    }

    pub async fn stage(&self, job_id: Uuid, data: JsonValue) -> Result<JobEvent, StoreError> {
        self.record(job_id, EventType::Stage, data).await
    }

    /// Updates the job row, then emits the matching events
    ///
    /// A progress change emits a `progress` event and a status change a
    /// `state` event, in that order. Nothing is emitted when the job was no
    /// longer running; the return value says whether the patch applied.
    pub async fn apply(&self, job_id: Uuid, patch: JobPatch) -> Result<bool, StoreError> {
        if !self.store.update(job_id, &patch).await? {
            return Ok(false);
        }

        if let Some(progress) = patch.progress {
            self.record(
                job_id,
                EventType::Progress,
                json!({ "progress": progress.clamp(0.0, 1.0) }),
            )
            .await?;
        }
        if let Some(status) = patch.status {
            self.record(job_id, EventType::State, json!({ "status": status }))
                .await?;
        }
        Ok(true)
    }

    /// Stored status of the job, `None` when unknown
    pub async fn status(&self, job_id: Uuid) -> Result<Option<JobStatus>, StoreError> {
        Ok(self.store.get(job_id).await?.map(|job| job.status))
    }

    /// Whether the job is still running according to the store
    pub async fn is_running(&self, job_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.status(job_id).await? == Some(JobStatus::Running))
    }

    /// Ends live delivery for the job
    pub fn close(&self, job_id: Uuid) {
        self.broadcaster.close(job_id);
    }
}
