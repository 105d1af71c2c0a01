//! Process handles and graceful shutdown

use async_trait::async_trait;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Control surface over one launched step, whatever backend runs it
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// OS pid of the launched process (the runtime client for containers)
    fn pid(&self) -> Option<u32>;

    fn has_exited(&self) -> bool;

    /// Asks the process to stop (SIGTERM or equivalent)
    async fn terminate(&self) -> io::Result<()>;

    /// Forces the process to stop
    async fn kill(&self) -> io::Result<()>;

    /// Waits for exit and returns the exit code
    async fn wait(&self) -> i32;
}

/// Maps an exit status to a code; signal deaths become `128 + signal`
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

/// Exit code of a child, observable from any number of waiters
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<i32>>,
}

impl ExitWatch {
    /// Takes ownership of the child and reaps it in a background task
    pub fn spawn(mut child: Child) -> Self {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!("Failed to wait for child process: {}", e);
                    -1
                }
            };
            let _ = tx.send(Some(code));
        });
        Self { rx }
    }

    pub fn code(&self) -> Option<i32> {
        *self.rx.borrow()
    }

    pub async fn wait(&self) -> i32 {
        let mut rx = self.rx.clone();
        let code = rx
            .wait_for(|code| code.is_some())
            .await
            .map(|code| code.unwrap_or(-1));
        code.unwrap_or(-1)
    }
}

/// Terminates, waits up to `grace`, then kills
pub async fn shutdown(handle: Arc<dyn ProcessHandle>, grace: Duration) {
    if handle.has_exited() {
        debug!("Process already exited, nothing to stop");
        return;
    }

    if let Err(e) = handle.terminate().await {
        warn!("Failed to send termination signal: {}", e);
    }

    match tokio::time::timeout(grace, handle.wait()).await {
        Ok(code) => debug!("Process stopped with exit code {}", code),
        Err(_) => {
            warn!("Process still running after {:?}, killing", grace);
            if let Err(e) = handle.kill().await {
                warn!("Failed to kill process: {}", e);
            }
        }
    }
}
