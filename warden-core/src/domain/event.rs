//! Job event domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An entry in a job's append-only event log
///
/// `seq` is 1-based and strictly increasing per job; it is assigned by the
/// store at append time and defines the canonical replay order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub seq: u64,
    pub ts: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    State,
    Log,
    Progress,
    Stage,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::State => "state",
            EventType::Log => "log",
            EventType::Progress => "progress",
            EventType::Stage => "stage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "state" => Some(EventType::State),
            "log" => Some(EventType::Log),
            "progress" => Some(EventType::Progress),
            "stage" => Some(EventType::Stage),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobEvent {
    /// Status carried by a `state` event, if this is one
    pub fn state_status(&self) -> Option<&str> {
        match self.event_type {
            EventType::State => self.data.get("status").and_then(|s| s.as_str()),
            _ => None,
        }
    }

    /// Progress value carried by a `progress` event, if this is one
    pub fn progress_value(&self) -> Option<f64> {
        match self.event_type {
            EventType::Progress => self.data.get("progress").and_then(|p| p.as_f64()),
            _ => None,
        }
    }
}
