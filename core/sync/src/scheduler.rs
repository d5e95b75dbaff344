//! Background replay scheduling.
//!
//! One cancellable task owns the periodic trigger: every interval while
//! reachable it replays the queue, and a became-reachable transition
//! triggers an immediate pass. The task stops deterministically through
//! its handle rather than relying on process exit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;
use crate::remote::RemoteAuthority;

/// Configuration for the background sync task.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval between periodic replay passes while reachable.
    pub sync_interval: Duration,
}

impl SyncConfig {
    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(300),
        }
    }
}

/// Handle to the background sync task.
pub struct SyncTaskHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SyncTaskHandle {
    /// Stop the task and wait for it to finish. No further periodic
    /// passes run after this returns.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// Spawn the periodic replay task for an engine.
pub fn spawn_sync_task<R: RemoteAuthority + 'static>(
    engine: Arc<SyncEngine<R>>,
    config: SyncConfig,
) -> SyncTaskHandle {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

    // Subscribe before spawning so a transition racing task startup is
    // still observed as an edge.
    let mut connectivity = engine.monitor().subscribe();

    let task = tokio::spawn(async move {
        let period = config.sync_interval;
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        info!(interval = ?period, "sync task started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("sync task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if engine.monitor().is_reachable() {
                        run_pass(&engine, "periodic").await;
                    }
                }
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *connectivity.borrow_and_update() {
                        run_pass(&engine, "became-reachable").await;
                    }
                }
            }
        }
    });

    SyncTaskHandle { shutdown_tx, task }
}

async fn run_pass<R: RemoteAuthority>(engine: &SyncEngine<R>, trigger: &str) {
    match engine.sync_pending().await {
        Ok(report) if report.already_running => {
            debug!(trigger, "replay already in flight");
        }
        Ok(report) => {
            info!(
                trigger,
                confirmed = report.confirmed,
                failed = report.failed,
                "replay pass finished"
            );
        }
        Err(err) => warn!(trigger, error = %err, "replay pass failed"),
    }
}
