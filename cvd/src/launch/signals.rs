//! Hand-off of SIGINT, SIGHUP and SIGTERM to a [`SubprocessWaiter`].
//!
//! A spawned task listens on tokio signal streams and interrupts the waiter
//! for every signal it sees. At most one bridge is active in a process.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::debug;

use super::waiter::SubprocessWaiter;

static BRIDGE_ACTIVE: AtomicBool = AtomicBool::new(false);

fn listen(kind: SignalKind, name: &str) -> Result<Signal> {
    signal(kind).with_context(|| format!("failed to register {} handler", name))
}

async fn forward_signals(
    mut interrupt: Signal,
    mut hangup: Signal,
    mut terminate: Signal,
    waiter: SubprocessWaiter,
) {
    loop {
        let name = tokio::select! {
            Some(()) = interrupt.recv() => "SIGINT",
            Some(()) = hangup.recv() => "SIGHUP",
            Some(()) = terminate.recv() => "SIGTERM",
            else => break,
        };
        debug!(signal = name, "interrupt signal received");
        waiter.interrupt();
    }
}

/// Routes interrupt signals to a [`SubprocessWaiter`] while alive.
///
/// Must be enabled from inside a tokio runtime.
pub struct SignalBridge {
    task: Option<JoinHandle<()>>,
}

impl SignalBridge {
    pub fn enable(waiter: SubprocessWaiter) -> Result<Self> {
        if BRIDGE_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            bail!("interrupt signal bridge is already enabled");
        }

        let streams = listen(SignalKind::interrupt(), "SIGINT").and_then(|interrupt| {
            let hangup = listen(SignalKind::hangup(), "SIGHUP")?;
            let terminate = listen(SignalKind::terminate(), "SIGTERM")?;
            Ok((interrupt, hangup, terminate))
        });
        let (interrupt, hangup, terminate) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                BRIDGE_ACTIVE.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let task = tokio::spawn(forward_signals(interrupt, hangup, terminate, waiter));
        debug!("interrupt signal bridge enabled");
        Ok(Self { task: Some(task) })
    }

    /// Stop forwarding signals and release the bridge for the next launch.
    pub fn disable(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            BRIDGE_ACTIVE.store(false, Ordering::SeqCst);
            debug!("interrupt signal bridge disabled");
        }
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
