//! Supervised background maintenance for the artifact store.
//!
//! One periodic task re-applies cache limits and sweeps orphaned media
//! bytes. Each pass runs on its own spawned task so a slow sweep never
//! stalls the tick loop, and passes are deduplicated with an atomic
//! guard: a tick that fires while a pass is still in flight is a no-op
//! instead of stacking concurrent passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::ArtifactStore;

/// Handle to the running maintenance task.
pub struct MaintenanceTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MaintenanceTask {
    /// Spawn the periodic maintenance loop. The first pass runs after one
    /// full interval, not at startup.
    pub fn spawn(store: Arc<ArtifactStore>, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // completes immediately, skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_guarded(&store, &running);
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            log::info!("maintenance task shutting down");
                            return;
                        }
                    }
                }
            }
        });

        Self { shutdown, handle }
    }

    /// Signal shutdown and wait for the tick loop to exit. A pass already
    /// in flight is detached and runs to completion on its own.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Start one pass unless another is still in progress. The flag is held
/// for the lifetime of the spawned pass, not just this call.
fn run_guarded(store: &Arc<ArtifactStore>, running: &Arc<AtomicBool>) {
    if running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        log::debug!("maintenance pass already running, skipping tick");
        return;
    }
    let store = store.clone();
    let running = running.clone();
    tokio::spawn(async move {
        if let Err(e) = store.run_maintenance().await {
            log::warn!("maintenance pass failed: {e}");
        }
        running.store(false, Ordering::SeqCst);
    });
}
