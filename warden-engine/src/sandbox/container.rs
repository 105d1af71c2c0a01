//! Container backend
//!
//! Drives docker or podman through its CLI. One `run --rm` per step; the
//! container is named after the job and step so cancellation can address it.

use super::handle::{ExitWatch, ProcessHandle};
use super::spec::ExecutionSpec;
use super::{BackendError, ExecutionBackend, RunningProcess, pump_output};
use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ContainerBackend {
    runtime: String,
}

impl ContainerBackend {
    /// `runtime` is the CLI to invoke, e.g. `docker` or `podman`
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Checks whether the runtime daemon answers `info`
    pub async fn probe(&self) -> bool {
        let status = Command::new(&self.runtime)
            .arg("info")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) => status.success(),
            Err(e) => {
                debug!("{} info failed: {}", self.runtime, e);
                false
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
    fn name(&self) -> &str {
        &self.runtime
    }

    async fn available(&self) -> bool {
        self.probe().await
    }

    async fn spawn(&self, spec: &ExecutionSpec) -> Result<RunningProcess, BackendError> {
        if spec.command.is_empty() {
            return Err(BackendError::EmptyCommand);
        }

        let args = spec.container_args();
        debug!("{} {}", self.runtime, args.join(" "));

        let mut child = Command::new(&self.runtime)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|source| BackendError::Spawn {
                program: self.runtime.clone(),
                source,
            })?;

        let pid = child.id();
        info!("Started container {} with {}", spec.name, self.runtime);

        let output = pump_output(&mut child);
        let handle = Arc::new(ContainerProcess {
            runtime: self.runtime.clone(),
            name: spec.name.clone(),
            pid,
            exit: ExitWatch::spawn(child),
        });

        Ok(RunningProcess {
            pid,
            handle,
            output,
        })
    }
}

/// A running `<runtime> run` client and the container it owns
struct ContainerProcess {
    runtime: String,
    name: String,
    pid: Option<u32>,
    exit: ExitWatch,
}

impl ContainerProcess {
    async fn runtime_command(&self, args: &[&str]) -> io::Result<()> {
        let output = Command::new(&self.runtime)
            .args(args)
            .arg(&self.name)
            .stdin(Stdio::null())
            .output()
            .await?;

        // The container may already be gone; that is not an error here
        if !output.status.success() {
            debug!(
                "{} {} {} failed: {}",
                self.runtime,
                args.join(" "),
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessHandle for ContainerProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn has_exited(&self) -> bool {
        self.exit.code().is_some()
    }

    async fn terminate(&self) -> io::Result<()> {
        self.runtime_command(&["kill", "--signal", "TERM"]).await
    }

    async fn kill(&self) -> io::Result<()> {
        self.runtime_command(&["rm", "-f"]).await
    }

    async fn wait(&self) -> i32 {
        self.exit.wait().await
    }
}
