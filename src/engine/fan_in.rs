//! Waiting on several queues at once.

use std::sync::Arc;

use futures::future::select_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::Work;
use crate::queue::QueueManager;
use crate::telemetry::metrics;

/// Wait until any of `sources` delivers work or `cancel` fires.
///
/// A source whose buffer closes is dropped from the wait set; when every
/// source has closed the wait fails with [`Error::Closed`]. Cancellation is
/// checked before any source, so a fired token never yields work.
pub async fn wait_any(
    cancel: &CancellationToken,
    sources: Vec<Arc<QueueManager>>,
) -> Result<(Work, String)> {
    let keys: Vec<String> = sources.iter().map(|q| q.key().to_string()).collect();

    let waits: Vec<_> = sources
        .into_iter()
        .map(|queue| {
            Box::pin(async move {
                let work = queue.recv().await;
                (queue, work)
            })
        })
        .collect();

    let first_delivery = async move {
        let mut pending = waits;
        while !pending.is_empty() {
            let ((queue, work), _, rest) = select_all(pending).await;
            match work {
                Some(work) => return Some((work, queue.key().to_string())),
                None => {
                    debug!(queue = %queue.key(), "source closed, dropped from wait");
                    pending = rest;
                }
            }
        }
        None
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        delivered = first_delivery => {
            let delivered = delivered.ok_or_else(|| Error::Closed(keys.join(",")))?;
            metrics::record_delivered("fan_in");
            Ok(delivered)
        }
    }
}
