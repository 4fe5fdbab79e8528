//! Shared fixtures: an in-memory `EventDb` and event builders.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use auditrex_core::database::EventDb;
use auditrex_core::error::Result;
use auditrex_core::events::{AuditEvent, EventFilter, ShipperCursor};

pub fn make_event(guid: &str, created_at: &str) -> AuditEvent {
    AuditEvent {
        guid: guid.to_string(),
        created_at: created_at.parse().expect("valid test timestamp"),
        event_type: "audit.app.create".to_string(),
        actor: "actor-guid".to_string(),
        actor_type: "user".to_string(),
        actor_name: "some-user".to_string(),
        actor_username: "some-user@example.com".to_string(),
        actee: "actee-guid".to_string(),
        actee_type: "app".to_string(),
        actee_name: "some-app".to_string(),
        organization_guid: None,
        space_guid: None,
        metadata: serde_json::Value::Null,
    }
}

/// Mirror of the Postgres store semantics, close enough for pipeline tests:
/// guid-unique inserts, epoch sentinel, cursor-scoped unshipped reads.
#[derive(Default)]
pub struct InMemoryEventDb {
    events: Mutex<Vec<AuditEvent>>,
    cursors: Mutex<HashMap<String, ShipperCursor>>,
}

impl InMemoryEventDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, events: Vec<AuditEvent>) {
        let mut stored = self.events.lock().unwrap();
        for event in events {
            if !stored.iter().any(|e| e.guid == event.guid) {
                stored.push(event);
            }
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn guids(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.guid.clone())
            .collect()
    }

    pub fn cursor(&self, name: &str) -> Option<ShipperCursor> {
        self.cursors.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl EventDb for InMemoryEventDb {
    async fn store_audit_events(&self, events: &[AuditEvent]) -> Result<()> {
        self.seed(events.to_vec());
        Ok(())
    }

    async fn get_latest_event_time(&self) -> Result<DateTime<Utc>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.created_at)
            .max()
            .unwrap_or(DateTime::UNIX_EPOCH))
    }

    async fn get_event_count(&self) -> Result<i64> {
        Ok(self.event_count() as i64)
    }

    async fn get_events(&self, filter: EventFilter) -> Result<Vec<AuditEvent>> {
        let mut events = self.events.lock().unwrap().clone();
        if !filter.reverse {
            events.reverse();
        }
        if let Some(limit) = filter.limit {
            events.truncate(limit as usize);
        }
        Ok(events)
    }

    async fn get_unshipped_events_for_shipper(&self, name: &str) -> Result<Vec<AuditEvent>> {
        let (after, shipped_id) = self
            .cursor(name)
            .map(|c| (c.updated_at, c.shipped_id))
            .unwrap_or((DateTime::UNIX_EPOCH, String::new()));
        let mut events: Vec<AuditEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.created_at >= after && e.guid != shipped_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        events.truncate(2048);
        Ok(events)
    }

    async fn update_shipper_cursor(
        &self,
        name: &str,
        updated_at: DateTime<Utc>,
        shipped_id: &str,
    ) -> Result<()> {
        self.cursors.lock().unwrap().insert(
            name.to_string(),
            ShipperCursor {
                name: name.to_string(),
                updated_at,
                shipped_id: shipped_id.to_string(),
            },
        );
        Ok(())
    }
}
