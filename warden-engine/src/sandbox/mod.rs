//! Sandboxed step execution
//!
//! A step is translated into an [`ExecutionSpec`] and handed to an
//! [`ExecutionBackend`]. The container backend is preferred; when the
//! policy asks for the host runner, or the container runtime does not
//! answer its probe, the host backend runs steps instead. The probe runs
//! for every step, and a container that fails to spawn also falls back
//! to the host.

pub mod container;
pub mod handle;
pub mod host;
pub mod spec;

pub use container::ContainerBackend;
pub use handle::{ProcessHandle, shutdown};
pub use host::HostBackend;
pub use spec::{CommandLine, ExecutionSpec, StepContext};

use crate::registry::{ProcessRegistry, Registration};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_core::domain::policy::{RunnerKind, SecurityPolicy};

/// Lines buffered between the output readers and the consumer
const OUTPUT_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("empty command line")]
    EmptyCommand,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// A freshly spawned step
pub struct RunningProcess {
    pub pid: Option<u32>,
    pub handle: Arc<dyn ProcessHandle>,
    /// Interleaved stdout and stderr lines, closed when both streams end
    pub output: mpsc::Receiver<String>,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the backend can take a step right now
    async fn available(&self) -> bool {
        true
    }

    async fn spawn(&self, spec: &ExecutionSpec) -> Result<RunningProcess, BackendError>;
}

/// Backend selection plus process registration
pub struct Sandbox {
    preferred: Option<Arc<dyn ExecutionBackend>>,
    fallback: Arc<dyn ExecutionBackend>,
    registry: Arc<ProcessRegistry>,
}

impl Sandbox {
    /// Prefers the policy's container runtime, falling back to the host
    pub fn from_policy(policy: &SecurityPolicy, registry: Arc<ProcessRegistry>) -> Self {
        let preferred: Option<Arc<dyn ExecutionBackend>> = match policy.runner_kind() {
            RunnerKind::Container => Some(Arc::new(ContainerBackend::new(policy.container_runtime()))),
            RunnerKind::Host => None,
        };

        Self {
            preferred,
            fallback: Arc::new(HostBackend::new()),
            registry,
        }
    }

    /// Always uses `backend`
    pub fn with_backend(backend: Arc<dyn ExecutionBackend>, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            preferred: None,
            fallback: backend,
            registry,
        }
    }

    /// Tries `preferred` first and `fallback` when it is unavailable
    pub fn with_fallback(
        preferred: Arc<dyn ExecutionBackend>,
        fallback: Arc<dyn ExecutionBackend>,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            preferred: Some(preferred),
            fallback,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Backend for the next step
    pub async fn select(&self) -> Arc<dyn ExecutionBackend> {
        if let Some(preferred) = &self.preferred {
            if preferred.available().await {
                debug!("Using backend {}", preferred.name());
                return preferred.clone();
            }
            warn!("Backend {} unavailable, running on {}", preferred.name(), self.fallback.name());
        }
        self.fallback.clone()
    }

    /// Spawns the step and registers its handle under `job_id`
    pub async fn launch(&self, job_id: Uuid, spec: &ExecutionSpec) -> Result<Execution, BackendError> {
        let mut backend = self.select().await;
        let spawned = backend.spawn(spec).await;
        let process = match spawned {
            Ok(process) => process,
            Err(e @ BackendError::Spawn { .. }) if !Arc::ptr_eq(&backend, &self.fallback) => {
                warn!(
                    "Backend {} failed to spawn {}: {}, running on {}",
                    backend.name(),
                    spec.name,
                    e,
                    self.fallback.name()
                );
                backend = self.fallback.clone();
                backend.spawn(spec).await?
            }
            Err(e) => return Err(e),
        };
        let registration = self.registry.register(job_id, process.handle.clone());

        info!(
            "Launched {} for job {} on {} (pid {:?})",
            spec.name,
            job_id,
            backend.name(),
            process.pid
        );

        Ok(Execution {
            pid: process.pid,
            output: process.output,
            handle: process.handle,
            _registration: registration,
        })
    }
}

/// A registered, running step; deregistered when finished or dropped
pub struct Execution {
    pid: Option<u32>,
    output: mpsc::Receiver<String>,
    handle: Arc<dyn ProcessHandle>,
    _registration: Registration,
}

impl Execution {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next output line, `None` once both streams are closed
    pub async fn next_line(&mut self) -> Option<String> {
        self.output.recv().await
    }

    /// Waits for the process to exit and returns its exit code
    pub async fn finish(self) -> i32 {
        self.handle.wait().await
    }
}

/// Forwards a child's stdout and stderr, line by line, into one channel
pub(crate) fn pump_output(child: &mut Child) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_lines(stderr, tx));
    }
    rx
}

async fn read_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(trim_line_ending(&buf)).into_owned();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Output stream closed: {}", e);
                break;
            }
        }
    }
}

fn trim_line_ending(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}
