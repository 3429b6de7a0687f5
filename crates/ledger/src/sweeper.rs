//! Queue expiry sweeper
//!
//! Periodically purges expired queue codes from the ledger.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::store::LedgerStore;

/// Background queue sweeper
pub struct QueueSweeper;

/// Owns the sweeper task. Dropping it ends the loop at its next wake-up;
/// `stop()` also waits for the task to finish.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl QueueSweeper {
    /// Spawn the sweep loop. The first sweep runs one `interval` after start.
    pub fn spawn(store: Arc<dyn LedgerStore>, interval: Duration) -> SweeperHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!(
                "Starting queue sweeper (every {} seconds)",
                interval.as_secs()
            );

            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.cleanup_expired_queue_codes().await {
                            Ok(0) => debug!("No expired queue codes"),
                            Ok(removed) => info!("Purged {} expired queue code(s)", removed),
                            // Keep sweeping; the next tick retries
                            Err(e) => error!("Queue sweep failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            info!("Queue sweeper stopped");
        });

        SweeperHandle { shutdown, task }
    }
}

impl SweeperHandle {
    /// Signal the loop to exit and wait for it
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Queue sweeper task panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::FileStore;
    use crate::models::QueueCode;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_on_tick() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn LedgerStore> =
            Arc::new(FileStore::open(dir.path().join("ledger.json")).await.unwrap());

        // Already expired in wall-clock terms
        let expired = QueueCode::new("echo", chrono::Duration::seconds(-1));
        assert!(store.create_queue_code(&expired).await.unwrap());

        let handle = QueueSweeper::spawn(store.clone(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(store.get_queue_code(&expired.code).await.unwrap().is_some());

        // Reads wait on the store lock until the sweep's rewrite lands
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(store.get_queue_code(&expired.code).await.unwrap().is_none());

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_ends_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn LedgerStore> =
            Arc::new(FileStore::open(dir.path().join("ledger.json")).await.unwrap());

        let handle = QueueSweeper::spawn(store.clone(), Duration::from_secs(60));
        drop(handle);
        tokio::task::yield_now().await;

        let expired = QueueCode::new("echo", chrono::Duration::seconds(-1));
        assert!(store.create_queue_code(&expired).await.unwrap());

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(store.get_queue_code(&expired.code).await.unwrap().is_some());
    }
}
