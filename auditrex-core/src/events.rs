//! Canonical audit event records as stored and forwarded by this service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An immutable record of one control-plane action.
///
/// `guid` is globally unique across the upstream API; re-ingesting a known
/// guid is a no-op. `created_at` is assigned by the upstream and never
/// changes once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub guid: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub actor: String,
    pub actor_type: String,
    pub actor_name: String,
    pub actor_username: String,
    pub actee: String,
    pub actee_type: String,
    pub actee_name: String,
    pub organization_guid: Option<Uuid>,
    pub space_guid: Option<Uuid>,
    pub metadata: serde_json::Value,
}

/// Per-shipper checkpoint: the `created_at` and `guid` of the last event
/// confirmed delivered downstream. The guid component lets the unshipped
/// query say "strictly after this point" even when several events share a
/// timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipperCursor {
    pub name: String,
    pub updated_at: DateTime<Utc>,
    pub shipped_id: String,
}

/// Options for raw event reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventFilter {
    /// Ascending insertion order when true, descending otherwise.
    pub reverse: bool,
    /// Maximum number of rows; `None` returns everything.
    pub limit: Option<i64>,
}
