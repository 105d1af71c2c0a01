//! Registry of running job processes
//!
//! Maps a job to the handle of its currently running step so cancellation
//! can reach it. Registrations are scoped: dropping the [`Registration`]
//! removes the entry, unless a newer step of the same job replaced it.

use crate::sandbox::{ProcessHandle, shutdown};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

struct Entry {
    token: u64,
    handle: Arc<dyn ProcessHandle>,
}

#[derive(Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<Uuid, Entry>>,
    next_token: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(self: &Arc<Self>, job_id: Uuid, handle: Arc<dyn ProcessHandle>) -> Registration {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.entries().insert(job_id, Entry { token, handle });
        debug!("Registered process for job {}", job_id);

        Registration {
            registry: Arc::clone(self),
            job_id,
            token,
        }
    }

    pub fn get(&self, job_id: Uuid) -> Option<Arc<dyn ProcessHandle>> {
        self.entries().get(&job_id).map(|entry| entry.handle.clone())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts a graceful shutdown of the job's process in the background
    ///
    /// Returns false when no process is registered for the job.
    pub fn terminate(&self, job_id: Uuid, grace: Duration) -> bool {
        let Some(handle) = self.get(job_id) else {
            debug!("No running process for job {}", job_id);
            return false;
        };

        info!("Stopping process {:?} of job {}", handle.pid(), job_id);
        tokio::spawn(shutdown(handle, grace));
        true
    }

    fn release(&self, job_id: Uuid, token: u64) {
        let mut entries = self.entries();
        if entries.get(&job_id).is_some_and(|entry| entry.token == token) {
            entries.remove(&job_id);
            debug!("Deregistered process for job {}", job_id);
        }
    }
}

/// Keeps a registry entry alive
pub struct Registration {
    registry: Arc<ProcessRegistry>,
    job_id: Uuid,
    token: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(self.job_id, self.token);
    }
}
