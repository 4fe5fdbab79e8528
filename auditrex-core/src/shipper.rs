//! Forwarding of stored events to a Splunk HTTP Event Collector.
//!
//! Progress is checkpointed in the `shipper_cursors` table: the cursor only
//! advances over events confirmed delivered, so a crash or a mid-batch
//! failure re-sends at most the boundary event on the next cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::header;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::database::EventDb;
use crate::error::{AuditError, Result};
use crate::events::AuditEvent;
use crate::metrics::ShipperMetrics;

/// Cursor key for this shipper.
pub const SHIPPER_NAME: &str = "cf-audit-events-to-splunk";

const SOURCETYPE: &str = "cf-audit-event";

/// Per-request timeout on HEC posts.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Exponential backoff envelope for one event's delivery attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub exponent: f64,
    pub jitter: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(15),
            exponent: 2.0,
            jitter: Duration::from_millis(500),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let grown = self.initial.as_secs_f64() * self.exponent.powi(attempt.min(16) as i32);
        let capped = grown.min(self.max.as_secs_f64());
        let jitter = if self.jitter.is_zero() {
            0.0
        } else {
            rand::rng().random_range(0.0..self.jitter.as_secs_f64())
        };
        Duration::from_secs_f64(capped + jitter)
    }
}

#[derive(Debug, Clone)]
pub struct ShipperConfig {
    pub schedule: Duration,
    pub deploy_env: String,
    pub api_key: String,
    pub hec_endpoint_url: String,
    pub backoff: BackoffPolicy,
}

#[derive(Serialize)]
struct SplunkEvent<'a> {
    sourcetype: &'static str,
    source: &'a str,
    event: &'a AuditEvent,
}

pub struct SplunkShipper {
    config: ShipperConfig,
    store: Arc<dyn EventDb>,
    http: reqwest::Client,
    metrics: ShipperMetrics,
    events_shipped: u64,
}

impl SplunkShipper {
    pub fn new(
        config: ShipperConfig,
        store: Arc<dyn EventDb>,
        metrics: ShipperMetrics,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AuditError::Config(format!("building splunk http client: {e}")))?;
        Ok(Self {
            config,
            store,
            http,
            metrics,
            events_shipped: 0,
        })
    }

    /// Ship batches on the configured schedule until cancelled. All failures
    /// are absorbed, counted and retried on a later cycle.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!("started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.schedule) => {
                    let started = Instant::now();
                    self.ship_cycle(&shutdown).await;
                    self.metrics
                        .ship_duration_total
                        .inc_by(started.elapsed().as_secs_f64());
                }
            }
        }
    }

    async fn ship_cycle(&mut self, shutdown: &CancellationToken) {
        let started = Instant::now();
        let events = match self
            .store
            .get_unshipped_events_for_shipper(SHIPPER_NAME)
            .await
        {
            Ok(events) => events,
            Err(err) => {
                error!(error = %err, "loading unshipped events failed");
                self.metrics.errors_total.inc();
                return;
            }
        };

        let mut last_shipped: Option<&AuditEvent> = None;
        let mut all_events_shipped = true;
        for event in &events {
            if shutdown.is_cancelled() {
                all_events_shipped = false;
                break;
            }
            match self.ship_event(event, shutdown).await {
                Ok(()) => {
                    last_shipped = Some(event);
                    self.events_shipped += 1;
                    self.metrics.events_shipped_total.inc();
                }
                Err(_) if shutdown.is_cancelled() => {
                    all_events_shipped = false;
                    break;
                }
                Err(err) => {
                    // Later events must not overtake this one; the whole
                    // remainder waits for the next cycle.
                    error!(guid = %event.guid, error = %err, "shipping event failed");
                    all_events_shipped = false;
                    break;
                }
            }
        }

        if let Some(event) = last_shipped {
            match self
                .store
                .update_shipper_cursor(SHIPPER_NAME, event.created_at, &event.guid)
                .await
            {
                Ok(()) => {
                    self.metrics
                        .latest_event_timestamp
                        .set(event.created_at.timestamp());
                }
                Err(err) => {
                    error!(shipper = SHIPPER_NAME, error = %err, "updating shipper cursor failed");
                    self.metrics.errors_total.inc();
                }
            }
        }

        info!(
            duration = ?started.elapsed(),
            events_shipped = self.events_shipped,
            all_events_shipped,
            "shipped events"
        );
    }

    async fn ship_event(&self, event: &AuditEvent, shutdown: &CancellationToken) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.post_event(event).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    self.metrics.errors_total.inc();
                    attempt += 1;
                    if attempt >= self.config.backoff.max_attempts {
                        return Err(err);
                    }
                    let delay = self.config.backoff.delay(attempt - 1);
                    debug!(guid = %event.guid, attempt, ?delay, error = %err, "retrying ship");
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            return Err(AuditError::Ship("cancelled during retry backoff".into()));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn post_event(&self, event: &AuditEvent) -> Result<()> {
        let payload = SplunkEvent {
            sourcetype: SOURCETYPE,
            source: &self.config.deploy_env,
            event,
        };
        let response = self
            .http
            .post(&self.config.hec_endpoint_url)
            .header(
                header::AUTHORIZATION,
                format!("Splunk {}", self.config.api_key),
            )
            .json(&payload)
            .send()
            .await
            .map_err(|e| AuditError::Ship(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(AuditError::Ship(format!(
            "status: {} body: {body}",
            status.as_u16()
        )))
    }
}

impl std::fmt::Debug for SplunkShipper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplunkShipper")
            .field("schedule", &self.config.schedule)
            .field("hec_endpoint_url", &self.config.hec_endpoint_url)
            .field("events_shipped", &self.events_shipped)
            .finish_non_exhaustive()
    }
}
