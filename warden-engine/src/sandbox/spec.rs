//! Policy to execution-spec translation
//!
//! Combines the security policy, one pipeline step and the job's runtime
//! context into a backend-neutral [`ExecutionSpec`]. The container backend
//! renders it as runtime CLI flags; the host backend uses the command, working
//! directory and filtered environment only.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;
use warden_core::domain::pipeline::PipelineStep;
use warden_core::domain::policy::{SAFE_PATH, SecurityPolicy};

/// Mount point of the project working tree inside the sandbox
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Network used when a step asks for network access
pub const PERMISSIVE_NETWORK: &str = "bridge";

/// How a step's command is expressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// A script run through the policy shell
    Shell(String),
    /// An explicit program and arguments
    Argv(Vec<String>),
}

impl CommandLine {
    /// Final argv, expanding shell scripts with the policy shell prefix
    pub fn to_argv(&self, policy: &SecurityPolicy) -> Vec<String> {
        match self {
            CommandLine::Shell(script) => {
                let mut argv = if policy.shell.is_empty() {
                    vec!["/bin/bash".to_string(), "-lc".to_string()]
                } else {
                    policy.shell.clone()
                };
                argv.push(script.clone());
                argv
            }
            CommandLine::Argv(argv) => argv.clone(),
        }
    }
}

/// Job-level inputs to one step's execution
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub job_id: Uuid,
    pub step_index: usize,
    pub workdir: &'a Path,
    /// Caller-supplied environment (already merged with pipeline env)
    pub env: &'a HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory: Option<String>,
    pub cpus: Option<String>,
    pub pids_limit: Option<u64>,
    pub ulimit_nofile: Option<String>,
}

/// Concrete description of one sandboxed process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSpec {
    /// Sandbox name, unique per job step
    pub name: String,
    pub image: String,
    pub workdir: PathBuf,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Mount specs, working tree first
    pub binds: Vec<String>,
    pub network: String,
    pub user: Option<String>,
    pub limits: ResourceLimits,
    pub read_only_root: bool,
    pub tmpfs: Vec<String>,
    pub cap_drop: Vec<String>,
    pub no_new_privileges: bool,
}

impl ExecutionSpec {
    pub fn build(
        policy: &SecurityPolicy,
        step: &PipelineStep,
        command: &CommandLine,
        ctx: StepContext<'_>,
    ) -> Self {
        let security = &policy.security;

        let workdir_bind = format!("{}:{}:rw", ctx.workdir.display(), WORKSPACE_MOUNT);
        let mut binds = vec![workdir_bind];
        for bind in &step.binds {
            let resolved = policy.resolve_bind(bind).to_string();
            if !resolved.contains(':') {
                warn!("Ignoring bind '{}': not a preset or host:container spec", bind);
                continue;
            }
            if !binds.contains(&resolved) {
                binds.push(resolved);
            }
        }

        let network = if step.net {
            PERMISSIVE_NETWORK.to_string()
        } else {
            policy.network().to_string()
        };

        Self {
            name: sandbox_name(ctx.job_id, ctx.step_index),
            image: step
                .image
                .clone()
                .filter(|i| !i.trim().is_empty())
                .unwrap_or_else(|| policy.default_image.clone()),
            workdir: ctx.workdir.to_path_buf(),
            command: command.to_argv(policy),
            env: filter_env(policy, &[&policy.env, ctx.env, &step.env]),
            binds,
            network,
            user: step.user.clone(),
            limits: ResourceLimits {
                memory: step.memory.clone().or_else(|| security.memory.clone()),
                cpus: step.cpus.clone().or_else(|| security.cpus.clone()),
                pids_limit: security.pids_limit,
                ulimit_nofile: security.ulimit_nofile.clone(),
            },
            read_only_root: security.read_only_root,
            tmpfs: security.tmpfs.clone(),
            cap_drop: policy.cap_drop(),
            no_new_privileges: security.no_new_privileges,
        }
    }

    /// Arguments for `<runtime> run ...`
    pub fn container_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            self.name.clone(),
            "-w".into(),
            WORKSPACE_MOUNT.into(),
        ];

        if self.read_only_root {
            args.push("--read-only".into());
        }
        for tmpfs in &self.tmpfs {
            args.push("--tmpfs".into());
            args.push(tmpfs.clone());
        }
        for cap in &self.cap_drop {
            args.push("--cap-drop".into());
            args.push(cap.clone());
        }
        if self.no_new_privileges {
            args.push("--security-opt".into());
            args.push("no-new-privileges".into());
        }
        if let Some(pids) = self.limits.pids_limit {
            args.push("--pids-limit".into());
            args.push(pids.to_string());
        }
        if let Some(nofile) = &self.limits.ulimit_nofile {
            args.push("--ulimit".into());
            args.push(format!("nofile={}", nofile));
        }
        if let Some(memory) = &self.limits.memory {
            args.push("--memory".into());
            args.push(memory.clone());
        }
        if let Some(cpus) = &self.limits.cpus {
            args.push("--cpus".into());
            args.push(cpus.clone());
        }

        args.push("--network".into());
        args.push(self.network.clone());

        for bind in &self.binds {
            args.push("-v".into());
            args.push(bind.clone());
        }
        for (key, value) in &self.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        if let Some(user) = &self.user {
            args.push("--user".into());
            args.push(user.clone());
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Merges env layers (later wins) and keeps only allow-listed names
///
/// A surviving `PATH` is replaced by [`SAFE_PATH`].
pub fn filter_env(
    policy: &SecurityPolicy,
    layers: &[&HashMap<String, String>],
) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for layer in layers {
        for (key, value) in layer.iter() {
            if policy.env_allowlist.iter().any(|allowed| allowed == key) {
                merged.insert(key.clone(), value.clone());
            }
        }
    }

    if let Some(path) = merged.get_mut("PATH") {
        *path = SAFE_PATH.to_string();
    }
    merged
}

/// `warden_job_<job id without dashes>_<step index>`
pub fn sandbox_name(job_id: Uuid, step_index: usize) -> String {
    format!("warden_job_{}_{}", job_id.simple(), step_index)
}
