//! Persistence layer: the `EventDb` port and its Postgres implementation.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::events::{AuditEvent, EventFilter};

/// Storage operations required by the collector, shipper and informer.
///
/// Implemented by [`postgres::EventStore`]; mocked in unit tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventDb: Send + Sync {
    /// All-or-nothing insert of a batch. Events whose `guid` is already
    /// stored are skipped; an empty batch succeeds without touching the
    /// database.
    async fn store_audit_events(&self, events: &[AuditEvent]) -> Result<()>;

    /// Max `created_at` across all stored events, or the Unix epoch when the
    /// store is empty. Never fails with "no rows".
    async fn get_latest_event_time(&self) -> Result<DateTime<Utc>>;

    /// Fast approximate row count from the catalog row estimate.
    async fn get_event_count(&self) -> Result<i64>;

    /// Raw event read in insertion (`id`) order.
    async fn get_events(&self, filter: EventFilter) -> Result<Vec<AuditEvent>>;

    /// Events not yet delivered by the named shipper: at most
    /// [`postgres::UNSHIPPED_BATCH_LIMIT`] rows strictly after the shipper's
    /// cursor, ascending by `created_at`.
    async fn get_unshipped_events_for_shipper(&self, name: &str) -> Result<Vec<AuditEvent>>;

    /// Upsert the named shipper's cursor.
    async fn update_shipper_cursor(
        &self,
        name: &str,
        updated_at: DateTime<Utc>,
        shipped_id: &str,
    ) -> Result<()>;
}
