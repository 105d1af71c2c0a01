//! Progress/stage marker protocol
//!
//! Jobs report progress out-of-band by printing markers into their combined
//! output stream:
//!
//! - `[[PROGRESS 45%]]`, `[[PROGRESS 0.45]]` or a JSON line `{"progress": 45}`
//! - `[[STAGE compile]]`, `[[STAGE name=compile done]]`, `[[STAGE lint error code=2]]`
//!
//! Values above 1 are percentages. Anything malformed is simply not a marker.

use regex::Regex;
use serde_json::{Map, Value as JsonValue, json};
use std::sync::LazyLock;

/// Minimum change in step progress worth an event
pub const PROGRESS_EPSILON: f64 = 0.01;

static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[\[\s*PROGRESS\s+([0-9.]+)%?\s*\]\]").expect("progress marker regex")
});

static STAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\[\s*STAGE\s+(.+?)\s*\]\]").expect("stage marker regex"));

/// Terminal disposition selected by a stage marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageDisposition {
    Start,
    Done,
    Error,
}

impl StageDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageDisposition::Start => "start",
            StageDisposition::Done => "done",
            StageDisposition::Error => "error",
        }
    }
}

/// A decoded `[[STAGE ...]]` marker
#[derive(Debug, Clone, PartialEq)]
pub struct StageMarker {
    pub name: String,
    pub disposition: StageDisposition,
    /// Remaining tokens; bare tokens map to `true`
    pub attrs: Map<String, JsonValue>,
}

impl StageMarker {
    /// Payload of the `stage` event this marker produces
    pub fn to_event_data(&self) -> JsonValue {
        let mut data = json!({
            "name": self.name,
            "status": self.disposition.as_str(),
        });
        if !self.attrs.is_empty() {
            data["attrs"] = JsonValue::Object(self.attrs.clone());
        }
        data
    }
}

/// Decodes a progress marker, normalised to [0, 1]
pub fn parse_progress(line: &str) -> Option<f64> {
    if let Some(caps) = PROGRESS_RE.captures(line) {
        let value = caps.get(1)?.as_str().parse::<f64>().ok()?;
        return Some(normalize(value));
    }

    let trimmed = line.trim();
    if trimmed.starts_with('{') && trimmed.contains("progress") {
        let parsed: JsonValue = serde_json::from_str(trimmed).ok()?;
        let value = parsed.get("progress")?.as_f64()?;
        return Some(normalize(value));
    }

    None
}

fn normalize(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let value = if value > 1.0 { value / 100.0 } else { value };
    value.clamp(0.0, 1.0)
}

/// Decodes a stage marker; markers without a name are ignored
pub fn parse_stage(line: &str) -> Option<StageMarker> {
    let caps = STAGE_RE.captures(line)?;
    let body = caps.get(1)?.as_str();

    let mut name: Option<String> = None;
    let mut positional: Option<String> = None;
    let mut done = false;
    let mut error = false;
    let mut attrs = Map::new();

    for token in body.split_whitespace() {
        match token.split_once('=') {
            Some(("name", value)) if !value.is_empty() => name = Some(value.to_string()),
            Some((key, value)) if !key.is_empty() => {
                attrs.insert(key.to_string(), JsonValue::String(value.to_string()));
            }
            Some(_) => {}
            None => match token.to_ascii_lowercase().as_str() {
                "done" => done = true,
                "error" => error = true,
                "start" => {}
                _ if positional.is_none() => positional = Some(token.to_string()),
                _ => {
                    attrs.insert(token.to_string(), JsonValue::Bool(true));
                }
            },
        }
    }

    let name = match (name, positional) {
        (Some(name), Some(flag)) => {
            attrs.insert(flag, JsonValue::Bool(true));
            name
        }
        (name, positional) => name.or(positional)?,
    };
    let disposition = if error {
        StageDisposition::Error
    } else if done {
        StageDisposition::Done
    } else {
        StageDisposition::Start
    };

    Some(StageMarker {
        name,
        disposition,
        attrs,
    })
}

/// Tracks the last reported step progress to rate-limit progress events
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    last: f64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` if it moved by at least [`PROGRESS_EPSILON`]
    pub fn observe(&mut self, value: f64) -> Option<f64> {
        let value = value.clamp(0.0, 1.0);
        if (value - self.last).abs() >= PROGRESS_EPSILON {
            self.last = value;
            Some(value)
        } else {
            None
        }
    }

    /// Last value that passed the threshold
    pub fn last(&self) -> f64 {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_marker() {
        assert_eq!(parse_progress("[[PROGRESS 45%]]"), Some(0.45));
        assert_eq!(parse_progress("building... [[ progress 80 ]] ok"), Some(0.8));
    }

    #[test]
    fn test_fraction_marker() {
        assert_eq!(parse_progress("[[PROGRESS 0.3]]"), Some(0.3));
        assert_eq!(parse_progress("[[PROGRESS 1]]"), Some(1.0));
    }

    #[test]
    fn test_json_progress_line() {
        assert_eq!(parse_progress(r#"{"progress":0.2}"#), Some(0.2));
        assert_eq!(parse_progress(r#"  {"step": "x", "progress": 75}"#), Some(0.75));
    }

    #[test]
    fn test_lines_without_markers() {
        assert_eq!(parse_progress("compiling 45% of crates"), None);
        assert_eq!(parse_progress(r#"{"progress": "half"}"#), None);
        assert_eq!(parse_progress(r#"{"progress": 0.5"#), None);
        assert_eq!(parse_progress("[[PROGRESS 1.2.3]]"), None);
        assert_eq!(parse_progress(""), None);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        assert_eq!(parse_progress("[[PROGRESS 250]]"), Some(1.0));
        assert_eq!(parse_progress(r#"{"progress": -3}"#), Some(0.0));
    }

    #[test]
    fn test_stage_positional_name() {
        let marker = parse_stage("[[STAGE compile]]").unwrap();
        assert_eq!(marker.name, "compile");
        assert_eq!(marker.disposition, StageDisposition::Start);
        assert!(marker.attrs.is_empty());
    }

    #[test]
    fn test_stage_named_with_disposition_and_attrs() {
        let marker = parse_stage("[[STAGE name=lint error code=2 flaky]]").unwrap();
        assert_eq!(marker.name, "lint");
        assert_eq!(marker.disposition, StageDisposition::Error);
        assert_eq!(marker.attrs.get("code"), Some(&JsonValue::String("2".into())));
        assert_eq!(marker.attrs.get("flaky"), Some(&JsonValue::Bool(true)));

        let data = marker.to_event_data();
        assert_eq!(data["status"], "error");
        assert_eq!(data["attrs"]["code"], "2");
    }

    #[test]
    fn test_bare_tokens_are_flags_when_name_is_explicit() {
        let marker = parse_stage("[[STAGE flaky name=lint]]").unwrap();
        assert_eq!(marker.name, "lint");
        assert_eq!(marker.attrs.get("flaky"), Some(&JsonValue::Bool(true)));

        let marker = parse_stage("[[STAGE name=lint flaky retried]]").unwrap();
        assert_eq!(marker.attrs.len(), 2);
        assert_eq!(marker.attrs.get("retried"), Some(&JsonValue::Bool(true)));
        assert_eq!(marker.to_event_data()["attrs"]["flaky"], true);
    }

    #[test]
    fn test_stage_done_wins_over_start_error_wins_over_done() {
        assert_eq!(
            parse_stage("[[STAGE test done]]").unwrap().disposition,
            StageDisposition::Done
        );
        assert_eq!(
            parse_stage("[[STAGE test done error]]").unwrap().disposition,
            StageDisposition::Error
        );
    }

    #[test]
    fn test_malformed_stage_markers_are_ignored() {
        assert!(parse_stage("[[STAGE ]]").is_none());
        assert!(parse_stage("[[STAGE done]]").is_none());
        assert!(parse_stage("[[STAGE =x]]").is_none());
        assert!(parse_stage("STAGE build").is_none());
    }

    #[test]
    fn test_tracker_threshold() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.observe(0.005), None);
        assert_eq!(tracker.observe(0.45), Some(0.45));
        assert_eq!(tracker.observe(0.455), None);
        assert_eq!(tracker.observe(0.47), Some(0.47));
        assert_eq!(tracker.observe(0.2), Some(0.2));
        assert_eq!(tracker.last(), 0.2);
    }
}
