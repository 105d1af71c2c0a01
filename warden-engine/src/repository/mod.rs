//! Repository Module
//!
//! Persistence for jobs and their append-only event logs. The engine talks
//! to the [`JobStore`] trait; [`SqliteJobStore`] is the shipped
//! implementation.

pub mod sqlite;

pub use sqlite::SqliteJobStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;
use warden_core::domain::event::{EventType, JobEvent};
use warden_core::domain::job::Job;
use warden_core::dto::job::{JobFilter, JobPatch};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    /// Applies the patch to a running job
    ///
    /// Patches without a status also apply to errored jobs, whose remaining
    /// `on_error: continue` steps still report progress. Returns false when
    /// nothing was written.
    async fn update(&self, job_id: Uuid, patch: &JobPatch) -> Result<bool, StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Jobs ordered newest first
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Appends an event, assigning the next sequence number for the job
    async fn append_event(
        &self,
        job_id: Uuid,
        event_type: EventType,
        data: &serde_json::Value,
    ) -> Result<JobEvent, StoreError>;

    /// Events with `seq > after_seq`, in sequence order
    async fn list_events(&self, job_id: Uuid, after_seq: u64) -> Result<Vec<JobEvent>, StoreError>;
}
