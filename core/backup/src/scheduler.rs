//! Scheduled backup creation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::manager::BackupManager;

/// Configuration for the background backup task.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Interval between scheduled backups.
    pub backup_interval: Duration,
}

impl BackupConfig {
    #[must_use]
    pub const fn with_backup_interval(mut self, interval: Duration) -> Self {
        self.backup_interval = interval;
        self
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Handle to the background backup task.
pub struct BackupTaskHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl BackupTaskHandle {
    /// Stop the task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// Spawn the periodic backup task.
///
/// A failed backup is logged and not retried until the next window.
pub fn spawn_backup_task(manager: Arc<BackupManager>, config: BackupConfig) -> BackupTaskHandle {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

    let task = tokio::spawn(async move {
        let period = config.backup_interval;
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        info!(interval = ?period, "backup task started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("backup task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match manager.create_backup().await {
                        Ok(metadata) => {
                            info!(id = metadata.id, "scheduled backup created");
                        }
                        Err(err) => warn!(error = %err, "scheduled backup failed"),
                    }
                }
            }
        }
    });

    BackupTaskHandle { shutdown_tx, task }
}
