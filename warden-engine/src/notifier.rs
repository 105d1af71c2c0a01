//! Device notifications
//!
//! Best-effort status signals to an external device endpoint. Sending never
//! blocks or fails the job path: requests run in their own task and errors
//! are only logged.

use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the shared key
pub const KEY_HEADER: &str = "X-Warden-Key";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum DeviceSignal {
    #[serde(rename = "led.progress")]
    Progress { pct: u8, ttl_s: u32 },

    #[serde(rename = "led.celebrate")]
    Celebrate { ttl_s: u32 },

    #[serde(rename = "led.emotion")]
    Emotion { emotion: String, ttl_s: u32 },
}

impl DeviceSignal {
    /// Progress signal from a 0..=100 percentage
    pub fn progress(pct: f64, ttl_s: u32) -> Self {
        DeviceSignal::Progress {
            pct: pct.round().clamp(0.0, 100.0) as u8,
            ttl_s,
        }
    }

    pub fn success() -> Self {
        DeviceSignal::Celebrate { ttl_s: 20 }
    }

    pub fn failure() -> Self {
        DeviceSignal::Emotion {
            emotion: "error".to_string(),
            ttl_s: 20,
        }
    }
}

pub trait Notifier: Send + Sync {
    /// Queues a signal; never waits for delivery
    fn notify(&self, signal: DeviceSignal);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _signal: DeviceSignal) {}
}

/// POSTs signals as JSON to a device endpoint
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
    key: String,
}

impl HttpNotifier {
    /// Reads the shared key once; a missing key file sends an empty key
    pub fn new(url: impl Into<String>, key_path: &Path) -> Self {
        let key = match std::fs::read_to_string(key_path) {
            Ok(key) => key.trim().to_string(),
            Err(e) => {
                warn!("Failed to read notifier key {}: {}", key_path.display(), e);
                String::new()
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build notifier client, using defaults: {}", e);
                reqwest::Client::new()
            });

        Self {
            client,
            url: url.into(),
            key,
        }
    }
}

impl Notifier for HttpNotifier {
    fn notify(&self, signal: DeviceSignal) {
        let request = self
            .client
            .post(&self.url)
            .header(KEY_HEADER, &self.key)
            .json(&signal);

        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Delivered device signal {:?}", signal);
                }
                Ok(response) => debug!("Device endpoint answered {}", response.status()),
                Err(e) => debug!("Failed to deliver device signal: {}", e),
            }
        });
    }
}

/// Keeps every signal in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    signals: Mutex<Vec<DeviceSignal>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signals(&self) -> Vec<DeviceSignal> {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, signal: DeviceSignal) {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(signal);
    }
}
