//! Postgres-backed event store.
//!
//! Schema initialisation runs the embedded SQL files inside a single
//! transaction. Every operation is wrapped in a bounded timeout so a stalled
//! database can never wedge a component loop forever.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::database::EventDb;
use crate::error::{AuditError, Result};
use crate::events::{AuditEvent, EventFilter, ShipperCursor};

pub const EVENTS_TABLE: &str = "cf_audit_events";

/// Upper bound on one shipper batch.
pub const UNSHIPPED_BATCH_LIMIT: i64 = 2048;

pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

const SCHEMA_FILES: &[(&str, &str)] = &[
    (
        "create_cf_audit_events.sql",
        include_str!("sql/create_cf_audit_events.sql"),
    ),
    (
        "create_shipper_cursors.sql",
        include_str!("sql/create_shipper_cursors.sql"),
    ),
];

const EVENT_COLUMNS: &str = "guid, created_at, event_type, actor, actor_type, actor_name, \
     actor_username, actee, actee_type, actee_name, organization_guid, space_guid, metadata";

#[derive(Clone, Debug)]
pub struct EventStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    guid: String,
    created_at: DateTime<Utc>,
    event_type: Option<String>,
    actor: Option<String>,
    actor_type: Option<String>,
    actor_name: Option<String>,
    actor_username: Option<String>,
    actee: Option<String>,
    actee_type: Option<String>,
    actee_name: Option<String>,
    organization_guid: Option<Uuid>,
    space_guid: Option<Uuid>,
    metadata: Option<serde_json::Value>,
}

impl From<EventRow> for AuditEvent {
    fn from(row: EventRow) -> Self {
        AuditEvent {
            guid: row.guid,
            created_at: row.created_at,
            event_type: row.event_type.unwrap_or_default(),
            actor: row.actor.unwrap_or_default(),
            actor_type: row.actor_type.unwrap_or_default(),
            actor_name: row.actor_name.unwrap_or_default(),
            actor_username: row.actor_username.unwrap_or_default(),
            actee: row.actee.unwrap_or_default(),
            actee_type: row.actee_type.unwrap_or_default(),
            actee_name: row.actee_name.unwrap_or_default(),
            organization_guid: row.organization_guid,
            space_guid: row.space_guid,
            metadata: row.metadata.unwrap_or(serde_json::Value::Null),
        }
    }
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `cf_audit_events` and `shipper_cursors` tables if absent.
    pub async fn init(&self) -> Result<()> {
        info!("initializing event store schema");
        bounded(DEFAULT_INIT_TIMEOUT, self.run_schema_files()).await?;
        info!("event store schema initialized");
        Ok(())
    }

    async fn run_schema_files(&self) -> Result<()> {
        let mut tx = self.pool().begin().await.map_err(AuditError::database)?;
        for (name, ddl) in SCHEMA_FILES {
            info!(sql_file = name, "running schema file");
            sqlx::raw_sql(ddl)
                .execute(&mut *tx)
                .await
                .map_err(|e| match AuditError::database(e) {
                    AuditError::Database(msg) => {
                        AuditError::Database(format!("{name}: {msg}"))
                    }
                    other => other,
                })?;
        }
        tx.commit().await.map_err(AuditError::database)
    }

    /// Cursor lookup, mostly useful for inspection and tests; the unshipped
    /// query resolves the cursor inside the database.
    pub async fn get_shipper_cursor(&self, name: &str) -> Result<Option<ShipperCursor>> {
        let row: Option<(String, DateTime<Utc>, String)> = bounded(
            DEFAULT_QUERY_TIMEOUT,
            async {
                sqlx::query_as(
                    "SELECT name, updated_at, shipped_id FROM shipper_cursors WHERE name = $1",
                )
                .bind(name)
                .fetch_optional(self.pool())
                .await
                .map_err(AuditError::database)
            },
        )
        .await?;
        Ok(row.map(|(name, updated_at, shipped_id)| ShipperCursor {
            name,
            updated_at,
            shipped_id,
        }))
    }
}

#[async_trait]
impl EventDb for EventStore {
    async fn store_audit_events(&self, events: &[AuditEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        bounded(DEFAULT_STORE_TIMEOUT, async {
            let mut tx = self.pool().begin().await.map_err(AuditError::database)?;
            for event in events {
                sqlx::query(
                    "INSERT INTO cf_audit_events ( \
                         guid, created_at, event_type, actor, actor_type, actor_name, \
                         actor_username, actee, actee_type, actee_name, organization_guid, \
                         space_guid, metadata \
                     ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
                     ON CONFLICT (guid) DO NOTHING",
                )
                .bind(&event.guid)
                .bind(event.created_at)
                .bind(&event.event_type)
                .bind(&event.actor)
                .bind(&event.actor_type)
                .bind(&event.actor_name)
                .bind(&event.actor_username)
                .bind(&event.actee)
                .bind(&event.actee_type)
                .bind(&event.actee_name)
                .bind(event.organization_guid)
                .bind(event.space_guid)
                .bind(&event.metadata)
                .execute(&mut *tx)
                .await
                .map_err(AuditError::database)?;
            }
            tx.commit().await.map_err(AuditError::database)
        })
        .await
    }

    async fn get_latest_event_time(&self) -> Result<DateTime<Utc>> {
        let row: Option<(DateTime<Utc>,)> = bounded(DEFAULT_QUERY_TIMEOUT, async {
            sqlx::query_as(
                "SELECT created_at FROM cf_audit_events ORDER BY created_at DESC LIMIT 1",
            )
            .fetch_optional(self.pool())
            .await
            .map_err(AuditError::database)
        })
        .await?;
        Ok(row.map(|(created_at,)| created_at).unwrap_or(DateTime::UNIX_EPOCH))
    }

    async fn get_event_count(&self) -> Result<i64> {
        // Catalog row estimate; the table is append-only and too large for
        // an exact COUNT(*) scan.
        let row: Option<(i64,)> = bounded(DEFAULT_QUERY_TIMEOUT, async {
            sqlx::query_as(
                "SELECT GREATEST(reltuples, 0)::BIGINT FROM pg_class WHERE relname = $1",
            )
            .bind(EVENTS_TABLE)
            .fetch_optional(self.pool())
            .await
            .map_err(AuditError::database)
        })
        .await?;
        Ok(row.map(|(count,)| count).unwrap_or(0))
    }

    async fn get_events(&self, filter: EventFilter) -> Result<Vec<AuditEvent>> {
        let direction = if filter.reverse { "asc" } else { "desc" };
        let mut sql =
            format!("SELECT {EVENT_COLUMNS} FROM cf_audit_events ORDER BY id {direction}");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let rows: Vec<EventRow> = bounded(DEFAULT_QUERY_TIMEOUT, async {
            sqlx::query_as(&sql)
                .fetch_all(self.pool())
                .await
                .map_err(AuditError::database)
        })
        .await?;
        Ok(rows.into_iter().map(AuditEvent::from).collect())
    }

    async fn get_unshipped_events_for_shipper(&self, name: &str) -> Result<Vec<AuditEvent>> {
        // The cursor row may not exist yet; a missing cursor degrades to the
        // epoch sentinel and an empty guid, i.e. "everything".
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM cf_audit_events \
             WHERE created_at >= COALESCE( \
                     (SELECT updated_at FROM shipper_cursors WHERE name = $1), \
                     'epoch'::timestamptz) \
               AND guid <> COALESCE( \
                     (SELECT shipped_id FROM shipper_cursors WHERE name = $1), '') \
             ORDER BY created_at ASC \
             LIMIT $2"
        );
        let rows: Vec<EventRow> = bounded(DEFAULT_QUERY_TIMEOUT, async {
            sqlx::query_as(&sql)
                .bind(name)
                .bind(UNSHIPPED_BATCH_LIMIT)
                .fetch_all(self.pool())
                .await
                .map_err(AuditError::database)
        })
        .await?;
        Ok(rows.into_iter().map(AuditEvent::from).collect())
    }

    async fn update_shipper_cursor(
        &self,
        name: &str,
        updated_at: DateTime<Utc>,
        shipped_id: &str,
    ) -> Result<()> {
        bounded(DEFAULT_QUERY_TIMEOUT, async {
            sqlx::query(
                "INSERT INTO shipper_cursors (name, updated_at, shipped_id) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (name) DO UPDATE SET \
                     updated_at = EXCLUDED.updated_at, \
                     shipped_id = EXCLUDED.shipped_id",
            )
            .bind(name)
            .bind(updated_at)
            .bind(shipped_id)
            .execute(self.pool())
            .await
            .map_err(AuditError::database)?;
            Ok(())
        })
        .await
    }
}

async fn bounded<T, F>(limit: Duration, op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(AuditError::Database(format!(
            "operation timed out after {limit:?}"
        ))),
    }
}
