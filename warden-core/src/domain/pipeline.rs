//! Pipeline domain types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::policy::opt_string_or_number;

/// An ordered set of weighted steps executed under one job
///
/// Single-command jobs are represented as a one-step pipeline with weight 100.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSpec {
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
    #[serde(default)]
    pub on_error: OnError,
    /// Environment applied to every step, beneath the step's own env
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// What to do with the remaining steps once one fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Stop,
    Continue,
}

/// One independently sandboxed, independently write-gated unit of work
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStep {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub image: Option<String>,
    /// Bind preset names or literal `src:dst[:mode]` mount specs
    #[serde(default)]
    pub binds: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Glob patterns of paths this step may write; empty means policy default
    #[serde(default)]
    pub writes: Vec<String>,
    #[serde(default)]
    pub net: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub memory: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub cpus: Option<String>,
}

impl PipelineStep {
    /// Step name, falling back to `step-<n>` (1-based)
    pub fn display_name(&self, index: usize) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("step-{}", index + 1),
        }
    }

    /// Shell command for this step; an empty step runs `true`
    pub fn command(&self) -> &str {
        match &self.cmd {
            Some(cmd) if !cmd.trim().is_empty() => cmd,
            _ => "true",
        }
    }
}

impl PipelineSpec {
    /// Wraps a single step into a pipeline carrying the whole weight
    pub fn single(mut step: PipelineStep) -> Self {
        step.weight = 100.0;
        Self {
            steps: vec![step],
            on_error: OnError::Stop,
            env: HashMap::new(),
        }
    }

    /// Step weights scaled so they sum to 100
    ///
    /// Negative or non-finite weights count as zero. When nothing positive is
    /// declared every step receives an equal share.
    pub fn normalized_weights(&self) -> Vec<f64> {
        if self.steps.is_empty() {
            return Vec::new();
        }

        let declared: Vec<f64> = self
            .steps
            .iter()
            .map(|s| {
                if s.weight.is_finite() && s.weight > 0.0 {
                    s.weight
                } else {
                    0.0
                }
            })
            .collect();
        let total: f64 = declared.iter().sum();

        if total <= 0.0 {
            let share = 100.0 / self.steps.len() as f64;
            return vec![share; self.steps.len()];
        }

        declared.iter().map(|w| w * 100.0 / total).collect()
    }
}
