//! Periodic eviction of expired queues.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Registry;

/// Spawn the sweep loop. It runs every `interval` until `shutdown` fires.
pub(crate) fn spawn(
    registry: Arc<Registry>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let runtime = registry.runtime.clone();
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing can have expired yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("expiry sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    registry.sweep_expired();
                }
            }
        }
    });
}
