//! Interlock journal.
//!
//! Append-only: the interlock's durable state is the newest row. An
//! `engaged` row means the system must come back up blocked; a `reset` row
//! means an operator verified the coach and cleared it.

use chrono::{DateTime, Utc};
use coachnet_types::StopRecord;
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use tracing::info;

use crate::store::{SafetyStore, StoreError, parse_time};

/// One row of the interlock journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterlockEvent {
    Engaged(StopRecord),
    Reset {
        sequence: u64,
        identity: String,
        notes: String,
        at: DateTime<Utc>,
    },
}

impl InterlockEvent {
    pub fn is_engaged(&self) -> bool {
        matches!(self, InterlockEvent::Engaged(_))
    }

    pub fn sequence(&self) -> u64 {
        match self {
            InterlockEvent::Engaged(record) => record.sequence,
            InterlockEvent::Reset { sequence, .. } => *sequence,
        }
    }
}

impl SafetyStore {
    /// Journal an engagement.
    pub fn record_engaged(&self, record: &StopRecord) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO interlock_events (kind, sequence, reason, at)
             VALUES ('engaged', ?1, ?2, ?3)",
            params![record.sequence as i64, record.reason, record.engaged_at.to_rfc3339()],
        )?;
        info!(sequence = record.sequence, reason = %record.reason, "interlock engagement persisted");
        Ok(())
    }

    /// Journal an authorized reset.
    pub fn record_reset(&self, sequence: u64, identity: &str, notes: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO interlock_events (kind, sequence, identity, notes, at)
             VALUES ('reset', ?1, ?2, ?3, ?4)",
            params![sequence as i64, identity, notes, Utc::now().to_rfc3339()],
        )?;
        info!(sequence, %identity, "interlock reset persisted");
        Ok(())
    }

    /// Newest journal row, or `None` on a fresh database.
    pub fn last_interlock_event(&self) -> Result<Option<InterlockEvent>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT kind, sequence, reason, identity, notes, at
                 FROM interlock_events ORDER BY id DESC LIMIT 1",
                [],
                row_to_event,
            )
            .optional()?;
        row.transpose()
    }

    /// The `limit` newest journal rows, oldest first.
    pub fn interlock_history(&self, limit: usize) -> Result<Vec<InterlockEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT kind, sequence, reason, identity, notes, at FROM (
                 SELECT * FROM interlock_events ORDER BY id DESC LIMIT ?1
             ) ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row??);
        }
        Ok(events)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<InterlockEvent, StoreError>> {
    let kind: String = row.get(0)?;
    let sequence = row.get::<_, i64>(1)? as u64;
    let reason: String = row.get(2)?;
    let identity: Option<String> = row.get(3)?;
    let notes: Option<String> = row.get(4)?;
    let at = parse_time(5, &row.get::<_, String>(5)?)?;
    Ok(match kind.as_str() {
        "engaged" => Ok(InterlockEvent::Engaged(StopRecord {
            sequence,
            reason,
            engaged_at: at,
        })),
        "reset" => Ok(InterlockEvent::Reset {
            sequence,
            identity: identity.unwrap_or_default(),
            notes: notes.unwrap_or_default(),
            at,
        }),
        other => Err(StoreError::Corrupt(format!("unknown interlock event kind '{other}'"))),
    })
}
