//! Paginated retrieval of audit events from the control-plane API.
//!
//! The fetcher walks the server-provided next-page chain and emits one
//! channel message per page, so the consumer can persist a page while the
//! next one is in flight. It never retries; a failed run is abandoned and
//! the collector's next cycle starts over from the stored watermark.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{AuditError, Result};
use crate::events::AuditEvent;
use crate::upstream::ControlPlaneClient;

/// One page of events, or the error that ended the run.
pub type PageResult = Result<Vec<AuditEvent>>;

/// Page size requested from the upstream. A final page with exactly this
/// many events suggests more data is waiting.
pub const RESULTS_PER_PAGE: usize = 100;

/// Anything that can stream pages of events since a point in time into a
/// channel. The sender must be dropped on every return path so the consumer
/// observes end-of-stream.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch_since(&self, since: DateTime<Utc>, pages: mpsc::Sender<PageResult>);
}

pub struct AuditEventFetcher {
    client: Arc<dyn ControlPlaneClient>,
    pagination_wait_time: Duration,
}

#[derive(Deserialize)]
struct EventsPage {
    #[serde(default)]
    next_url: Option<String>,
    #[serde(default)]
    resources: Vec<EventResource>,
}

#[derive(Deserialize)]
struct EventResource {
    #[serde(alias = "metadata")]
    meta: ResourceMeta,
    entity: EventEntity,
}

#[derive(Deserialize)]
struct ResourceMeta {
    guid: String,
    created_at: String,
}

#[derive(Deserialize)]
struct EventEntity {
    #[serde(default, rename = "type")]
    event_type: String,
    #[serde(default)]
    actor: String,
    #[serde(default)]
    actor_type: String,
    #[serde(default)]
    actor_name: String,
    #[serde(default)]
    actor_username: String,
    #[serde(default)]
    actee: String,
    #[serde(default)]
    actee_type: String,
    #[serde(default)]
    actee_name: String,
    #[serde(default)]
    organization_guid: String,
    #[serde(default)]
    space_guid: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

impl AuditEventFetcher {
    pub fn new(client: Arc<dyn ControlPlaneClient>, pagination_wait_time: Duration) -> Self {
        Self {
            client,
            pagination_wait_time,
        }
    }

    async fn get_page(&self, url: &str) -> Result<(Vec<AuditEvent>, Option<String>)> {
        let body = self.client.get(url).await?;
        let page: EventsPage = serde_json::from_slice(&body)
            .map_err(|e| AuditError::Decode(format!("error unmarshaling events: {e}")))?;

        let mut events = Vec::with_capacity(page.resources.len());
        for resource in page.resources {
            events.push(project_event(resource)?);
        }
        Ok((events, page.next_url))
    }
}

/// Copy the resource's envelope identity into the event body and normalise
/// the optional scope GUIDs.
fn project_event(resource: EventResource) -> Result<AuditEvent> {
    let created_at = DateTime::parse_from_rfc3339(&resource.meta.created_at)
        .map_err(|e| {
            AuditError::Decode(format!(
                "invalid created_at {:?}: {e}",
                resource.meta.created_at
            ))
        })?
        .with_timezone(&Utc);
    let entity = resource.entity;
    Ok(AuditEvent {
        guid: resource.meta.guid,
        created_at,
        event_type: entity.event_type,
        actor: entity.actor,
        actor_type: entity.actor_type,
        actor_name: entity.actor_name,
        actor_username: entity.actor_username,
        actee: entity.actee,
        actee_type: entity.actee_type,
        actee_name: entity.actee_name,
        organization_guid: parse_scope_guid("organization_guid", &entity.organization_guid)?,
        space_guid: parse_scope_guid("space_guid", &entity.space_guid)?,
        metadata: entity.metadata,
    })
}

fn parse_scope_guid(field: &str, raw: &str) -> Result<Option<uuid::Uuid>> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|e| AuditError::Decode(format!("invalid {field} {raw:?}: {e}")))
}

/// Initial request URL for all events stamped strictly after `since`,
/// second precision, chronologically ascending.
fn start_page_url(since: DateTime<Utc>) -> String {
    let timestamp = format!("timestamp>{}", since.format("%Y-%m-%dT%H:%M:%SZ"));
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("q", &timestamp)
        .append_pair("results-per-page", &RESULTS_PER_PAGE.to_string())
        .finish();
    format!("/v2/events?{query}")
}

#[async_trait]
impl EventSource for AuditEventFetcher {
    async fn fetch_since(&self, since: DateTime<Utc>, pages: mpsc::Sender<PageResult>) {
        let mut next_url = start_page_url(since);
        info!(start_page_url = %next_url, "fetching");

        loop {
            let (events, next) = match self.get_page(&next_url).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(page_url = %next_url, error = %err, "fetching page failed");
                    // Consumer may already be gone; either way this run is over.
                    let _ = pages.send(Err(err)).await;
                    return;
                }
            };

            info!(page_url = %next_url, event_count = events.len(), "fetched page");
            if pages.send(Ok(events)).await.is_err() {
                return;
            }

            match next {
                Some(url) if !url.is_empty() => {
                    tokio::time::sleep(self.pagination_wait_time).await;
                    next_url = url;
                }
                _ => return,
            }
        }
    }
}

impl std::fmt::Debug for AuditEventFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditEventFetcher")
            .field("pagination_wait_time", &self.pagination_wait_time)
            .finish_non_exhaustive()
    }
}
