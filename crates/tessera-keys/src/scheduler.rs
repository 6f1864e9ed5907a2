//! Rotation scheduler.
//!
//! A Tokio task that wakes every `check_interval`, runs due rotations and
//! retention cleanup against the manager's clock, and can be paused, resumed
//! and shut down. Each pass runs on the blocking pool. Tests drive it with paused Tokio time plus a
//! [`ManualClock`](crate::ManualClock).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::lifecycle::KeyLifecycleManager;

/// Handle to a running scheduler task.
pub struct RotationScheduler {
    paused: watch::Sender<bool>,
    shutdown_tx: broadcast::Sender<()>,
    passes: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl RotationScheduler {
    /// Spawn the scheduler on the current Tokio runtime.
    pub fn spawn(manager: Arc<KeyLifecycleManager>, check_interval: Duration) -> Self {
        let (paused, paused_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let passes = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(run(
            manager,
            check_interval,
            paused_rx,
            shutdown_rx,
            Arc::clone(&passes),
        ));
        info!(?check_interval, "Rotation scheduler started");
        Self {
            paused,
            shutdown_tx,
            passes,
            handle,
        }
    }

    /// Stop running passes until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        let _ = self.paused.send(true);
        debug!("Rotation scheduler paused");
    }

    pub fn resume(&self) {
        let _ = self.paused.send(false);
        debug!("Rotation scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Number of completed (non-paused) passes.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    /// Signal the task to stop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            error!("Rotation scheduler task failed: {e}");
        }
        info!("Rotation scheduler stopped");
    }
}

async fn run(
    manager: Arc<KeyLifecycleManager>,
    check_interval: Duration,
    paused: watch::Receiver<bool>,
    mut shutdown_rx: broadcast::Receiver<()>,
    passes: Arc<AtomicU64>,
) {
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                if *paused.borrow() {
                    continue;
                }
                // Store I/O is blocking; keep it off the runtime's workers.
                let pass_manager = Arc::clone(&manager);
                let pass = tokio::task::spawn_blocking(move || run_pass(&pass_manager));
                if let Err(e) = pass.await {
                    error!("Rotation pass task failed: {e}");
                }
                passes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

fn run_pass(manager: &KeyLifecycleManager) {
    let now = manager.clock().now_millis();
    match manager.run_due_rotations(now) {
        Ok(report) => {
            for (key_id, reason) in &report.failed {
                error!(key_id = %key_id, reason = %reason, "Scheduled rotation failed; will retry");
            }
        }
        Err(e) => error!("Scheduled rotation pass failed: {e}"),
    }
    if let Err(e) = manager.cleanup_expired(now) {
        error!("Key retention cleanup failed: {e}");
    }
}
