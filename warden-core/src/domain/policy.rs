//! Sandbox security policy
//!
//! Loaded once at startup and shared read-only by every job for the lifetime
//! of the process. Every field has a default, so an empty document (or no
//! document at all) is a valid policy.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// `PATH` value forced into any sandboxed environment that carries one
pub const SAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub const DEFAULT_IMAGE: &str = "node:20-slim";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    #[serde(default = "default_image")]
    pub default_image: String,
    /// `docker`, `podman`, `container` or `host`
    #[serde(default = "default_runner")]
    pub runner: String,
    /// Argv prefix used to run shell command strings
    #[serde(default = "default_shell")]
    pub shell: Vec<String>,
    #[serde(default)]
    pub security: SandboxSecurity,
    #[serde(default, alias = "env_allow_list")]
    pub env_allowlist: Vec<String>,
    /// Environment defaults, still subject to the allow-list
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Named mount specs steps can refer to in `binds`
    #[serde(default)]
    pub bind_presets: HashMap<String, String>,
    #[serde(default)]
    pub default_allowed_writes: Option<Vec<String>>,
}

/// Resource and isolation settings applied to every sandbox
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxSecurity {
    #[serde(default)]
    pub read_only_root: bool,
    #[serde(default, alias = "tmpfs_paths")]
    pub tmpfs: Vec<String>,
    /// `None` drops every capability
    #[serde(default)]
    pub cap_drop: Option<Vec<String>>,
    #[serde(default)]
    pub no_new_privileges: bool,
    #[serde(default)]
    pub pids_limit: Option<u64>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub ulimit_nofile: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub memory: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub cpus: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
}

/// Which execution backend the policy asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    Container,
    Host,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            default_image: default_image(),
            runner: default_runner(),
            shell: default_shell(),
            security: SandboxSecurity::default(),
            env_allowlist: Vec::new(),
            env: HashMap::new(),
            bind_presets: HashMap::new(),
            default_allowed_writes: None,
        }
    }
}

impl SecurityPolicy {
    pub fn runner_kind(&self) -> RunnerKind {
        match self.runner.trim().to_lowercase().as_str() {
            "host" => RunnerKind::Host,
            _ => RunnerKind::Container,
        }
    }

    /// Container runtime binary (`docker` unless the policy names podman)
    pub fn container_runtime(&self) -> &'static str {
        if self.runner.trim().eq_ignore_ascii_case("podman") {
            "podman"
        } else {
            "docker"
        }
    }

    pub fn cap_drop(&self) -> Vec<String> {
        self.security
            .cap_drop
            .clone()
            .unwrap_or_else(|| vec!["ALL".to_string()])
    }

    pub fn network(&self) -> &str {
        self.security.network.as_deref().unwrap_or("none")
    }

    /// Write patterns used by steps that declare none
    pub fn allowed_writes(&self) -> Vec<String> {
        self.default_allowed_writes
            .clone()
            .unwrap_or_else(|| vec!["**".to_string()])
    }

    /// Resolves a bind entry: preset name first, literal mount spec otherwise
    pub fn resolve_bind<'a>(&'a self, bind: &'a str) -> &'a str {
        self.bind_presets
            .get(bind)
            .map(String::as_str)
            .unwrap_or(bind)
    }
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

fn default_runner() -> String {
    "docker".to_string()
}

fn default_shell() -> Vec<String> {
    vec!["/bin/bash".to_string(), "-lc".to_string()]
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
}

/// Accepts `512m`, `2` or `1.5` alike and keeps the textual form
pub(crate) fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Scalar>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        Scalar::Str(s) => s,
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
    }))
}
