//! Periodic expiry sweep.
//!
//! Runs the engine's sweep at a fixed interval (default one second) until
//! told to stop. A sweep is synchronous and atomic under the engine's write
//! guard, so stopping between two ticks never leaves a half-applied
//! transition.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Owned handle to the sweep task. Stopping is idempotent; dropping the
/// handle aborts a task that was never shut down.
pub struct SweeperHandle {
    wake: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Ask for a sweep now instead of at the next tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and wait for it. Returns false if it was already
    /// stopped; once this returns no further sweep runs.
    pub async fn shutdown(&mut self) -> bool {
        let Some(task) = self.task.take() else {
            return false;
        };
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = task.await {
            if !err.is_cancelled() {
                tracing::error!(error = %err, "sweeper task ended abnormally");
            }
        }
        true
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = self.shutdown_tx.send(true);
            task.abort();
        }
    }
}

/// Spawn the sweep loop on the current tokio runtime.
///
/// `sweep` returns how many messages it hid.
pub fn spawn_sweeper<F>(interval: Duration, sweep: F) -> SweeperHandle
where
    F: Fn() -> usize + Send + Sync + 'static,
{
    let wake = Arc::new(Notify::new());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let wake_clone = wake.clone();

    let task = tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "expiry sweeper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake_clone.notified() => {
                    debug!("expiry sweeper woken early");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("expiry sweeper shutting down");
                        return;
                    }
                }
            }

            if *shutdown_rx.borrow() {
                info!("expiry sweeper shutting down");
                return;
            }

            let hidden = sweep();
            if hidden > 0 {
                debug!(hidden, "sweep complete");
            }
        }
    });

    SweeperHandle {
        wake,
        shutdown_tx,
        task: Some(task),
    }
}
