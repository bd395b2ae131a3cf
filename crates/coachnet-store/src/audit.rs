//! Safety audit trail.

use chrono::{DateTime, Utc};
use coachnet_types::{Event, EventPayload, SafetyState};
use rusqlite::params;
use serde::Serialize;

use crate::store::{SafetyStore, StoreError, parse_time};

/// One row of the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub at: DateTime<Utc>,
    pub source: String,
    pub kind: String,
    pub component: Option<String>,
    pub identity: Option<String>,
    pub payload: serde_json::Value,
}

fn subject(payload: &EventPayload) -> (Option<&str>, Option<&str>) {
    match payload {
        EventPayload::SafetyTransition { component, .. } => (Some(component.as_str()), None),
        EventPayload::OperatorOverride {
            component, identity, ..
        } => (Some(component.as_str()), Some(identity.as_str())),
        EventPayload::InterlockReset { identity, .. } => (None, Some(identity.as_str())),
        EventPayload::EmergencyStop { .. }
        | EventPayload::SafeShutdown { .. }
        | EventPayload::Frame { .. } => (None, None),
    }
}

impl SafetyStore {
    /// Append `event` to the audit trail and return its row id.
    pub fn record_audit(&self, event: &Event) -> Result<i64, StoreError> {
        let payload = serde_json::to_value(&event.payload)?;
        let kind = payload
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or("unknown")
            .to_string();
        let (component, identity) = subject(&event.payload);
        let conn = self.conn();
        conn.execute(
            "INSERT INTO safety_audit (at, source, kind, component, identity, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.timestamp.to_rfc3339(),
                event.source,
                kind,
                component,
                identity,
                payload.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Record the state a component was left in at shutdown.
    pub fn record_final_state(&self, component: &str, state: SafetyState) -> Result<i64, StoreError> {
        let payload = serde_json::json!({ "kind": "final_state", "component": component, "state": state });
        let conn = self.conn();
        conn.execute(
            "INSERT INTO safety_audit (at, source, kind, component, payload)
             VALUES (?1, 'coachnetd', 'final_state', ?2, ?3)",
            params![Utc::now().to_rfc3339(), component, payload.to_string()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The `limit` newest audit rows, newest first. Filtered to one
    /// component when `component` is given.
    pub fn audit_trail(&self, component: Option<&str>, limit: usize) -> Result<Vec<AuditEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, at, source, kind, component, identity, payload
             FROM safety_audit
             WHERE ?1 IS NULL OR component = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![component, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                parse_time(1, &row.get::<_, String>(1)?)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, at, source, kind, component, identity, payload) = row?;
            entries.push(AuditEntry {
                id,
                at,
                source,
                kind,
                component,
                identity,
                payload: serde_json::from_str(&payload)?,
            });
        }
        Ok(entries)
    }
}
