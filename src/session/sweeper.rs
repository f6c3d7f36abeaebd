//! Periodic deletion of outdated refresh tokens.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::Result;
use crate::session::RefreshTokenStore;

/// Background task bounding refresh token storage.
pub struct ExpirySweeper {
    store: Arc<dyn RefreshTokenStore>,
    clock: Arc<dyn Clock>,
    retention: TimeDelta,
    interval: Duration,
}

impl ExpirySweeper {
    /// Create a new [`ExpirySweeper`].
    pub fn new(
        store: Arc<dyn RefreshTokenStore>,
        clock: Arc<dyn Clock>,
        retention: TimeDelta,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            retention,
            interval,
        }
    }

    /// Delete every refresh token older than the retention window.
    pub async fn sweep(&self) -> Result<u64> {
        let cutoff = self.clock.now() - self.retention;
        self.store.remove_older_than(cutoff).await
    }

    /// Sweep, logging the outcome. Never fails.
    async fn run(&self) {
        match self.sweep().await {
            Ok(removed) => {
                metrics::counter!("refresh_tokens_swept_total").increment(removed);
                tracing::info!(removed, "expired refresh tokens swept");
            },
            Err(err) => {
                tracing::error!(error = %err, "refresh token sweep failed, retrying next interval");
            },
        }
    }

    /// Sweep once, then keep sweeping on every interval until `shutdown` is
    /// cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.run().await;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => self.run().await,
                }
            }
        })
    }
}
