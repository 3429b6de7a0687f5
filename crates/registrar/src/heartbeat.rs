//! Heartbeat task
//!
//! Pings every registered (aggregator, API) pair on a fixed cadence. Each tick
//! runs in its own task so a slow aggregator never delays the next tick, and
//! every ping is bounded by the heartbeat timeout.

use provider_common::{Error, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::registrar::Registrar;

/// Owns the heartbeat task and its in-flight ticks
pub struct HeartbeatHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stop the timer and cancel ticks still in flight
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Heartbeat task panicked: {}", e);
        }
    }
}

impl Registrar {
    /// Arm the heartbeat timer. The first tick fires one interval from now.
    ///
    /// Refuses to start before [`Registrar::register_all`] has completed.
    pub fn start_heartbeat(self: &Arc<Self>) -> Result<HeartbeatHandle> {
        if !self.registration_complete() {
            return Err(Error::Other(anyhow::anyhow!(
                "heartbeat started before the registration pass completed"
            )));
        }

        let period = self.config.heartbeat_interval();
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let registrar = Arc::clone(self);

        let task = tokio::spawn(async move {
            info!(
                "Starting heartbeat (every {} seconds)",
                period.as_secs()
            );

            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ticks = JoinSet::new();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        ticks.spawn(Arc::clone(&registrar).heartbeat_tick());
                    }
                    Some(joined) = ticks.join_next(), if !ticks.is_empty() => {
                        if let Err(e) = joined {
                            error!("Heartbeat tick panicked: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            ticks.shutdown().await;
            info!("Heartbeat stopped");
        });

        Ok(HeartbeatHandle { shutdown, task })
    }

    /// Ping every registered pair once, concurrently
    pub async fn heartbeat_tick(self: Arc<Self>) {
        let pairs = self.registered_pairs();
        debug!("Heartbeat tick: {} pair(s)", pairs.len());

        let mut pings = JoinSet::new();
        for (aggregator, api_id) in pairs {
            pings.spawn(Arc::clone(&self).ping_pair(aggregator, api_id));
        }
        while let Some(joined) = pings.join_next().await {
            if let Err(e) = joined {
                error!("Heartbeat ping panicked: {}", e);
            }
        }
    }

    async fn ping_pair(self: Arc<Self>, aggregator: String, api_id: String) {
        let timeout = self.config.heartbeat_timeout();
        let result = tokio::time::timeout(
            timeout,
            self.client
                .heartbeat(&aggregator, &api_id, self.provider_address()),
        )
        .await
        .map_err(|_| Error::Timeout(timeout))
        .and_then(|inner| inner);

        match result {
            Ok(()) => {
                debug!("Heartbeat ok: {} @ {}", api_id, aggregator);
                self.update_pair(&aggregator, &api_id, |entry| entry.heartbeat_ok());
            }
            Err(e) => {
                warn!("Heartbeat failed: {} @ {}: {}", api_id, aggregator, e);
                let failures = self.update_pair(&aggregator, &api_id, |entry| {
                    entry.heartbeat_failed(e.to_string())
                });
                self.maybe_reregister(&aggregator, &api_id, failures).await;
            }
        }
    }

    /// Re-register a pair once its consecutive failures reach the configured
    /// threshold. Disabled unless `reregisterAfterFailures` is set.
    async fn maybe_reregister(&self, aggregator: &str, api_id: &str, failures: u32) {
        let threshold = match self.config.reregister_after_failures {
            Some(threshold) if threshold > 0 && failures >= threshold => threshold,
            _ => return,
        };

        let api = match self.find_api(api_id) {
            Some(api) => api,
            None => {
                warn!("API {} is no longer advertised, not re-registering", api_id);
                return;
            }
        };

        info!(
            "Re-registering {} with {} after {} failed heartbeats",
            api_id, aggregator, threshold
        );
        if self.register_api(aggregator, &api).await.is_err() {
            // Keep the pair in the heartbeat set so later ticks try again
            self.update_pair(aggregator, api_id, |entry| entry.reregister_failed());
        }
    }
}
