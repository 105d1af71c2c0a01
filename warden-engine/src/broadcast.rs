//! Live event fan-out
//!
//! One broadcast channel per running job. Publishing never waits on
//! subscribers: a subscriber that falls behind sees `Lagged` and catches up
//! from the store.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;
use warden_core::domain::event::JobEvent;

pub struct EventBroadcaster {
    channels: RwLock<HashMap<Uuid, broadcast::Sender<JobEvent>>>,
    capacity: usize,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Creates the job's channel; must happen before its first event
    pub fn open(&self, job_id: Uuid) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    pub fn publish(&self, event: &JobEvent) {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = channels.get(&event.job_id) {
            // No receivers is fine
            let _ = tx.send(event.clone());
        }
    }

    /// Drops the job's channel; attached receivers drain and then see `Closed`
    pub fn close(&self, job_id: Uuid) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if channels.remove(&job_id).is_some() {
            debug!("Closed event channel for job {}", job_id);
        }
    }

    /// Receiver for the job's future events, `None` once the job has finished
    pub fn attach(&self, job_id: Uuid) -> Option<broadcast::Receiver<JobEvent>> {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels.get(&job_id).map(|tx| tx.subscribe())
    }

    pub fn is_open(&self, job_id: Uuid) -> bool {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels.contains_key(&job_id)
    }
}
