//! Host backend
//!
//! Runs the step directly on the host in its own process group, with a
//! cleared environment. Only the command, working directory and filtered
//! environment of the [`ExecutionSpec`] apply here; the isolation flags are
//! container-only.

use super::handle::{ExitWatch, ProcessHandle};
use super::spec::ExecutionSpec;
use super::{BackendError, ExecutionBackend, RunningProcess, pump_output};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;
use warden_core::domain::policy::SAFE_PATH;

#[derive(Debug, Default, Clone)]
pub struct HostBackend;

impl HostBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecutionBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    async fn spawn(&self, spec: &ExecutionSpec) -> Result<RunningProcess, BackendError> {
        let (program, args) = spec.command.split_first().ok_or(BackendError::EmptyCommand)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&spec.workdir)
            .env_clear()
            .envs(&spec.env)
            .env("PATH", SAFE_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = command.spawn().map_err(|source| BackendError::Spawn {
            program: program.clone(),
            source,
        })?;

        let pid = child.id();
        debug!("Spawned host process {:?} for {}", pid, spec.name);

        let output = pump_output(&mut child);
        let handle = Arc::new(HostProcess {
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

/// A host process that leads its own process group
struct HostProcess {
    pid: Option<u32>,
    exit: ExitWatch,
}

impl HostProcess {
    fn signal_group(&self, signal: Signal) -> io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        if self.has_exited() {
            return Ok(());
        }

        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

#[async_trait]
impl ProcessHandle for HostProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn has_exited(&self) -> bool {
        self.exit.code().is_some()
    }

    async fn terminate(&self) -> io::Result<()> {
        self.signal_group(Signal::SIGTERM)
    }

    async fn kill(&self) -> io::Result<()> {
        self.signal_group(Signal::SIGKILL)
    }

    async fn wait(&self) -> i32 {
        self.exit.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::spec::{CommandLine, StepContext};
    use std::collections::HashMap;
    use std::time::Duration;
    use uuid::Uuid;
    use warden_core::domain::pipeline::PipelineStep;
    use warden_core::domain::policy::SecurityPolicy;

    fn shell_spec(dir: &std::path::Path, script: &str, env: &HashMap<String, String>) -> ExecutionSpec {
        let policy: SecurityPolicy =
            serde_yaml::from_str("runner: host\nshell: [/bin/sh, -c]\nenv_allowlist: [GREETING]\n").unwrap();
        let ctx = StepContext {
            job_id: Uuid::new_v4(),
            step_index: 0,
            workdir: dir,
            env,
        };
        ExecutionSpec::build(&policy, &PipelineStep::default(), &CommandLine::Shell(script.into()), ctx)
    }

    async fn collect(mut process: RunningProcess) -> (Vec<String>, i32) {
        let mut lines = Vec::new();
        while let Some(line) = process.output.recv().await {
            lines.push(line);
        }
        (lines, process.handle.wait().await)
    }

    #[tokio::test]
    async fn test_runs_in_workdir_with_filtered_env() {
        let dir = tempfile::tempdir().unwrap();
        let env = HashMap::from([
            ("GREETING".to_string(), "hello".to_string()),
            ("TOKEN".to_string(), "secret".to_string()),
        ]);
        let spec = shell_spec(
            dir.path(),
            "echo \"$GREETING\"; echo \"token=$TOKEN\"; echo \"$PATH\"; pwd",
            &env,
        );

        let process = HostBackend::new().spawn(&spec).await.unwrap();
        assert!(process.pid.is_some());
        let (lines, code) = collect(process).await;

        assert_eq!(code, 0);
        assert_eq!(lines[0], "hello");
        assert_eq!(lines[1], "token=");
        assert_eq!(lines[2], SAFE_PATH);
        let cwd = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(std::fs::canonicalize(&lines[3]).unwrap(), cwd);
    }

    #[tokio::test]
    async fn test_stderr_is_captured_and_exit_code_reported() {
        let dir = tempfile::tempdir().unwrap();
        let spec = shell_spec(dir.path(), "echo oops >&2; exit 4", &HashMap::new());

        let process = HostBackend::new().spawn(&spec).await.unwrap();
        let (lines, code) = collect(process).await;

        assert_eq!(lines, vec!["oops".to_string()]);
        assert_eq!(code, 4);
    }

    #[tokio::test]
    async fn test_terminate_stops_the_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let spec = shell_spec(dir.path(), "sleep 30 & sleep 30; wait", &HashMap::new());

        let process = HostBackend::new().spawn(&spec).await.unwrap();
        process.handle.terminate().await.unwrap();
        let (_, code) = tokio::time::timeout(Duration::from_secs(5), collect(process))
            .await
            .expect("process group should stop");

        assert_eq!(code, 128 + 15);
    }

    #[tokio::test]
    async fn test_missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = shell_spec(dir.path(), "true", &HashMap::new());
        spec.command = vec!["/nonexistent/warden-test-binary".to_string()];

        let err = HostBackend::new().spawn(&spec).await.err().unwrap();
        assert!(matches!(err, BackendError::Spawn { .. }));
    }
}
