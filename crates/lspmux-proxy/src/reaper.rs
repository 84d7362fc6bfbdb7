//! Periodic idle-connection eviction.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::proxy::Proxy;

/// Runs [`Proxy::shutdown_idle`] on a fixed interval until told to stop.
pub struct Reaper {
    proxy: Arc<Proxy>,
    max_idle: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(proxy: Arc<Proxy>, max_idle: Duration, interval: Duration) -> Self {
        Self {
            proxy,
            max_idle,
            interval,
        }
    }

    /// Sweep until `shutdown` is notified. Sweep failures are logged and
    /// never stop the loop.
    pub async fn run(self, shutdown: Arc<Notify>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately; skip the tick at startup
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.proxy.shutdown_idle(self.max_idle).await {
                        warn!("idle sweep: {e}");
                    }
                }
                _ = shutdown.notified() => break,
            }
        }
    }
}
