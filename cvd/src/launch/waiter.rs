use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::process::Child;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug)]
pub enum WaitOutcome {
    Exited(ExitStatus),
    /// The wait was cancelled. The child may still be running.
    Interrupted,
}

/// Waits for a child process and lets another thread cancel the wait.
///
/// Cloned handles share state. An interrupt that arrives before `wait`
/// starts is not lost.
#[derive(Clone, Default)]
pub struct SubprocessWaiter {
    notify: Arc<Notify>,
    interrupted: Arc<AtomicBool>,
}

impl SubprocessWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the current or next wait. Callable from any thread.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub async fn wait(&self, child: &mut Child) -> Result<WaitOutcome> {
        if self.is_interrupted() {
            return Ok(WaitOutcome::Interrupted);
        }
        tokio::select! {
            status = child.wait() => {
                let status = status.context("waiting for launcher process")?;
                debug!(?status, "launcher process exited");
                Ok(WaitOutcome::Exited(status))
            }
            _ = self.notify.notified() => {
                debug!("wait for launcher process interrupted");
                Ok(WaitOutcome::Interrupted)
            }
        }
    }
}
