//! Security policy loading
//!
//! The policy file is read exactly once, at startup. A missing or malformed
//! file degrades to the all-defaults policy instead of failing startup.

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use warden_core::domain::policy::SecurityPolicy;

/// Loads the policy at `path`, falling back to defaults
pub fn load_policy(path: &Path) -> Arc<SecurityPolicy> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            info!(
                "No security policy at {} ({}), using defaults",
                path.display(),
                e
            );
            return Arc::new(SecurityPolicy::default());
        }
    };

    Arc::new(parse_policy(&raw).unwrap_or_else(|e| {
        warn!(
            "Malformed security policy at {}: {}; using defaults",
            path.display(),
            e
        );
        SecurityPolicy::default()
    }))
}

fn parse_policy(raw: &str) -> Result<SecurityPolicy, serde_yaml::Error> {
    // An empty file parses as YAML null
    if raw.trim().is_empty() {
        return Ok(SecurityPolicy::default());
    }
    serde_yaml::from_str(raw)
}
