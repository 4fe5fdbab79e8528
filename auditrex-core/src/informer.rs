//! Observability gauges over the event store.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::database::EventDb;
use crate::error::Result;
use crate::metrics::InformerMetrics;

/// Periodically publishes the stored event count and the latest event
/// timestamp. A failing query zeroes its gauge for that tick rather than
/// stopping the loop.
pub struct Informer {
    schedule: Duration,
    store: Arc<dyn EventDb>,
    metrics: InformerMetrics,
}

impl Informer {
    pub fn new(schedule: Duration, store: Arc<dyn EventDb>, metrics: InformerMetrics) -> Self {
        Self {
            schedule,
            store,
            metrics,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!("started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.schedule) => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        match self.store.get_event_count().await {
            Ok(count) => self.metrics.events_total.set(count),
            Err(err) => {
                error!(error = %err, "event count query failed");
                self.metrics.events_total.set(0);
            }
        }

        match self.store.get_latest_event_time().await {
            // The empty-store sentinel is the epoch, which reads as 0 here.
            Ok(latest) => self.metrics.latest_event_timestamp.set(latest.timestamp()),
            Err(err) => {
                error!(error = %err, "latest event time query failed");
                self.metrics.latest_event_timestamp.set(0);
            }
        }
    }
}

impl std::fmt::Debug for Informer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Informer")
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}
