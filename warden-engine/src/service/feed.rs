//! Replay-then-live event subscriptions
//!
//! A subscriber first receives the persisted history, then live events,
//! with no gaps and no duplicates. The live receiver is attached before the
//! history is read; live events at or below the last delivered seq are
//! skipped and any gap (including broadcast lag) is filled from the store.

use crate::broadcast::EventBroadcaster;
use crate::repository::{JobStore, StoreError};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;
use warden_core::domain::event::JobEvent;

/// Opens a subscription; the stream ends after the job's final event
pub fn subscribe(
    store: Arc<dyn JobStore>,
    broadcaster: &EventBroadcaster,
    job_id: Uuid,
    buffer: usize,
) -> ReceiverStream<JobEvent> {
    let live = broadcaster.attach(job_id);
    let (tx, rx) = mpsc::channel(buffer.max(1));

    tokio::spawn(async move {
        let mut feed = Feed {
            store,
            job_id,
            tx,
            last_seq: 0,
        };
        if let Err(e) = feed.run(live).await {
            warn!("Event subscription for job {} failed: {}", job_id, e);
        }
    });

    ReceiverStream::new(rx)
}

struct Feed {
    store: Arc<dyn JobStore>,
    job_id: Uuid,
    tx: mpsc::Sender<JobEvent>,
    last_seq: u64,
}

impl Feed {
    async fn run(&mut self, live: Option<broadcast::Receiver<JobEvent>>) -> Result<(), StoreError> {
        if !self.backfill().await? {
            return Ok(());
        }

        // Finished job: history is complete
        let Some(mut live) = live else {
            return Ok(());
        };

        loop {
            match live.recv().await {
                Ok(event) if event.seq <= self.last_seq => continue,
                Ok(event) if event.seq == self.last_seq + 1 => {
                    if !self.deliver(event).await {
                        return Ok(());
                    }
                }
                Ok(event) => {
                    debug!(
                        "Gap before seq {} for job {}, reading from store",
                        event.seq, self.job_id
                    );
                    if !self.backfill().await? {
                        return Ok(());
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(
                        "Subscriber for job {} lagged by {} events",
                        self.job_id, skipped
                    );
                    if !self.backfill().await? {
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => {
                    self.backfill().await?;
                    return Ok(());
                }
            }
        }
    }

    /// Sends everything persisted after `last_seq`; false once the subscriber is gone
    async fn backfill(&mut self) -> Result<bool, StoreError> {
        let events = self.store.list_events(self.job_id, self.last_seq).await?;
        for event in events {
            if !self.deliver(event).await {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn deliver(&mut self, event: JobEvent) -> bool {
        let seq = event.seq;
        if self.tx.send(event).await.is_err() {
            debug!("Subscriber for job {} went away", self.job_id);
            return false;
        }
        self.last_seq = seq;
        true
    }
}
