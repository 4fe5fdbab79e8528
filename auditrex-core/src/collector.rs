//! Scheduled collection of audit events into the store.
//!
//! The collector drives the fetcher on a schedule, bridges its page channel
//! into batch inserts, and derives the next since-watermark from the store
//! itself on every cycle, so progress survives restarts without any local
//! bookkeeping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::database::EventDb;
use crate::error::Result;
use crate::fetcher::{EventSource, RESULTS_PER_PAGE};
use crate::metrics::CollectorMetrics;

/// Pages buffered between the fetcher and the store write loop. Bounds
/// memory to a few pages no matter how much the upstream has queued up.
pub const PAGE_CHANNEL_CAPACITY: usize = 3;

/// Lookback added to the stored watermark so events landing on the same
/// second as the watermark are never missed. Duplicates are discarded by the
/// guid uniqueness constraint.
const WATERMARK_OVERLAP_SECS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Just started; collect immediately after a short initial wait.
    Syncing,
    /// Caught up; next collection after the full schedule.
    Scheduled,
    /// The last cycle ended on a full page, so more data is probably
    /// waiting; only rate-limit by the minimum wait.
    Collecting,
}

#[derive(Debug, Clone, Copy)]
pub struct CollectorConfig {
    pub schedule: Duration,
    pub min_wait_time: Duration,
    pub initial_wait_time: Duration,
    /// Since-window used when the store is empty.
    pub initial_lookback: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            schedule: Duration::from_secs(120),
            min_wait_time: Duration::from_secs(3),
            initial_wait_time: Duration::from_secs(5),
            initial_lookback: Duration::from_secs(28 * 24 * 60 * 60),
        }
    }
}

pub struct AuditEventCollector {
    state: State,
    config: CollectorConfig,
    fetcher: Arc<dyn EventSource>,
    store: Arc<dyn EventDb>,
    metrics: CollectorMetrics,
    events_collected: u64,
}

impl AuditEventCollector {
    pub fn new(
        config: CollectorConfig,
        fetcher: Arc<dyn EventSource>,
        store: Arc<dyn EventDb>,
        metrics: CollectorMetrics,
    ) -> Self {
        Self {
            state: State::Syncing,
            config,
            fetcher,
            store,
            metrics,
            events_collected: 0,
        }
    }

    /// Collect periodically until cancelled. Transient failures are logged
    /// and retried on the next cycle; this only returns on shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!("started");
        loop {
            debug!(
                state = ?self.state,
                next_collection = ?self.wait_duration(),
                events_collected = self.events_collected,
                "status"
            );
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.wait_duration()) => {
                    let started = Instant::now();
                    match self.collect(&shutdown).await {
                        Ok(count) => {
                            self.events_collected += count as u64;
                            self.metrics.events_collected_total.inc_by(count as u64);
                            info!(
                                count,
                                duration = ?started.elapsed(),
                                events_collected = self.events_collected,
                                "collected"
                            );
                        }
                        Err(err) => {
                            self.state = State::Scheduled;
                            self.metrics.errors_total.inc();
                            error!(error = %err, "collect failed");
                        }
                    }
                    self.metrics
                        .collect_duration_total
                        .inc_by(started.elapsed().as_secs_f64());
                }
            }
        }
    }

    /// One cycle: fetch everything since the watermark and persist it page
    /// by page. Ends the cycle on the first fetch or store error; pages
    /// stored before the error stay stored.
    async fn collect(&mut self, shutdown: &CancellationToken) -> Result<usize> {
        let since = self.pull_events_since().await?;
        debug!(since = %since, "collect starting");

        let (tx, mut rx) = mpsc::channel(PAGE_CHANNEL_CAPACITY);
        let fetcher = Arc::clone(&self.fetcher);
        tokio::spawn(async move { fetcher.fetch_since(since, tx).await });

        let mut collected = 0;
        let mut last_page_len = 0;
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => {
                    // Dropping the receiver unblocks the producer.
                    return Ok(collected);
                }
                received = rx.recv() => received,
            };
            let Some(page) = received else { break };
            let events = page?;
            last_page_len = events.len();
            self.store.store_audit_events(&events).await?;
            collected += events.len();
            debug!(event_count = events.len(), "stored page");
        }

        self.state = if last_page_len >= RESULTS_PER_PAGE {
            State::Collecting
        } else {
            State::Scheduled
        };
        Ok(collected)
    }

    /// The watermark is authoritative from the store, never from memory, so
    /// a crashed run resumes from what was actually committed.
    async fn pull_events_since(&self) -> Result<DateTime<Utc>> {
        let latest = self.store.get_latest_event_time().await?;
        if latest == DateTime::UNIX_EPOCH {
            let lookback = TimeDelta::from_std(self.config.initial_lookback)
                .unwrap_or_else(|_| TimeDelta::days(28));
            return Ok(Utc::now() - lookback);
        }
        Ok(latest - TimeDelta::seconds(WATERMARK_OVERLAP_SECS))
    }

    fn wait_duration(&self) -> Duration {
        match self.state {
            State::Syncing => self.config.initial_wait_time,
            State::Scheduled => self.config.schedule,
            State::Collecting => self.config.min_wait_time,
        }
    }
}

impl std::fmt::Debug for AuditEventCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditEventCollector")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("events_collected", &self.events_collected)
            .finish_non_exhaustive()
    }
}
