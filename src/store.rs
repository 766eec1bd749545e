//! Durable event storage.
//!
//! The [`EventStore`] trait is the seam between the pipeline and a
//! concrete backend: one implementation per backend, never dialect
//! switching inside query strings. [`SqliteStore`] is the bundled
//! implementation; it lives behind a `std::sync::Mutex` so ingestion and
//! the background classification job can write concurrently, with a
//! bounded retry-with-backoff when SQLite reports a lock conflict.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use crate::types::{Classification, Event};

/// Bounded retry budget for writes that hit SQLITE_BUSY.
const MAX_WRITE_ATTEMPTS: u32 = 4;
const CONTENTION_BASE_DELAY_MS: u64 = 50;

/// Errors specific to storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage still locked after {attempts} attempts")]
    Contention { attempts: u32 },

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),
}

/// Per-agent aggregate for one week, computed on demand.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    pub agent_name: String,
    pub total: u32,
    pub sales: u32,
    pub unclassified: u32,
}

/// Week-level counts. `classified` tracks pipeline work state
/// (oracle-assigned labels); `sales` uses the effective classification.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekStatus {
    pub week: String,
    pub total: u32,
    pub classified: u32,
    pub sales: u32,
    pub unclassified: u32,
}

/// A row from the append-only `overrides` audit log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRecord {
    pub id: i64,
    pub event_title: String,
    pub original_classification: Option<Classification>,
    pub corrected_classification: Classification,
    pub created_at: String,
}

/// Storage contract for events, aggregates, and the override log.
pub trait EventStore: Send + Sync {
    /// Insert-or-merge by `(agent, title, start, week)`. On conflict,
    /// refreshes end time, description, and location only; never touches
    /// an existing classification or override.
    fn upsert_event(&self, event: &Event) -> Result<(), StoreError>;

    /// Bulk variant of [`EventStore::upsert_event`] in one transaction.
    /// Returns the number of events written.
    fn upsert_events_bulk(&self, events: &[Event]) -> Result<usize, StoreError>;

    /// All events for a week, optionally filtered to one agent, ordered
    /// by (agent name, start time) for determinism.
    fn events_for_week(
        &self,
        week_key: &str,
        agent_name: Option<&str>,
    ) -> Result<Vec<Event>, StoreError>;

    /// Events whose oracle classification is unset. Overrides are
    /// irrelevant here: this selects pipeline work, not display state.
    fn unclassified_events(&self, week_key: Option<&str>) -> Result<Vec<Event>, StoreError>;

    /// Idempotent point update of the oracle's verdict.
    fn set_classification(
        &self,
        event_id: &str,
        classification: Classification,
        confidence: f64,
        reasoning: &str,
    ) -> Result<(), StoreError>;

    /// Write a manager override and append an audit record capturing the
    /// event's title and prior classification. Silent no-op if the id is
    /// unknown.
    fn set_override(&self, event_id: &str, corrected: Classification) -> Result<(), StoreError>;

    fn agent_stats(&self, week_key: &str) -> Result<Vec<AgentStats>, StoreError>;

    fn week_status(&self, week_key: &str) -> Result<WeekStatus, StoreError>;

    /// Newest-first override records, bounded count.
    fn recent_overrides(&self, limit: u32) -> Result<Vec<OverrideRecord>, StoreError>;
}

const EVENT_COLUMNS: &str = "id, agent_name, title, start_time, end_time, description, \
     location, week_key, is_all_day, status, classification, confidence, ai_reasoning, \
     override, created_at";

/// SQLite-backed [`EventStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `~/.salesweek/events.db` and
    /// apply the schema.
    pub fn open() -> Result<Self, StoreError> {
        Self::open_at(Self::db_path()?)
    }

    /// Open a database at an explicit path. Useful for testing and for
    /// hosts that manage their own data directory.
    pub fn open_at(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL for concurrent readers; busy_timeout before our own retry
        // loop kicks in.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn db_path() -> Result<PathBuf, StoreError> {
        let home = dirs::home_dir().ok_or(StoreError::HomeDirNotFound)?;
        Ok(home.join(".salesweek").join("events.db"))
    }

    fn with_conn<T>(
        &self,
        op: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        op(&conn).map_err(StoreError::Sqlite)
    }

    /// Run a write, retrying on transient lock conflicts with backoff.
    /// Surfaces `StoreError::Contention` once the budget is exhausted.
    ///
    /// The backoff sleep blocks the calling thread, as does every other
    /// store call: async callers treat the whole store as blocking I/O.
    fn with_write_retry<T>(
        &self,
        mut op: impl FnMut(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut attempt = 1u32;
        loop {
            let result = {
                let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
                op(&conn)
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) => {
                    if attempt >= MAX_WRITE_ATTEMPTS {
                        return Err(StoreError::Contention { attempts: attempt });
                    }
                    let delay = CONTENTION_BASE_DELAY_MS * 2u64.pow(attempt - 1);
                    log::warn!(
                        "store: write contention (attempt {}/{}), retrying in {}ms",
                        attempt,
                        MAX_WRITE_ATTEMPTS,
                        delay
                    );
                    std::thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                }
                Err(err) => return Err(StoreError::Sqlite(err)),
            }
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _)
        if e.code == rusqlite::ErrorCode::DatabaseBusy
            || e.code == rusqlite::ErrorCode::DatabaseLocked)
}

fn execute_upsert(conn: &Connection, event: &Event) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO events (
             id, agent_name, title, start_time, end_time, description,
             location, week_key, is_all_day, status, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(agent_name, title, start_time, week_key) DO UPDATE SET
             end_time = excluded.end_time,
             description = excluded.description,
             location = excluded.location",
        params![
            event.id,
            event.agent_name,
            event.title,
            event.start_time,
            event.end_time,
            event.description,
            event.location,
            event.week_key,
            event.is_all_day as i64,
            event.status,
            event.created_at,
        ],
    )
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        agent_name: row.get(1)?,
        title: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        description: row.get(5)?,
        location: row.get(6)?,
        week_key: row.get(7)?,
        is_all_day: row.get::<_, i64>(8)? != 0,
        status: row.get(9)?,
        classification: row
            .get::<_, Option<String>>(10)?
            .as_deref()
            .and_then(Classification::parse),
        confidence: row.get(11)?,
        ai_reasoning: row.get(12)?,
        override_classification: row
            .get::<_, Option<String>>(13)?
            .as_deref()
            .and_then(Classification::parse),
        created_at: row.get(14)?,
    })
}

impl EventStore for SqliteStore {
    fn upsert_event(&self, event: &Event) -> Result<(), StoreError> {
        self.with_write_retry(|conn| {
            execute_upsert(conn, event)?;
            Ok(())
        })
    }

    fn upsert_events_bulk(&self, events: &[Event]) -> Result<usize, StoreError> {
        if events.is_empty() {
            return Ok(0);
        }
        self.with_write_retry(|conn| {
            let tx = conn.unchecked_transaction()?;
            for event in events {
                execute_upsert(&tx, event)?;
            }
            tx.commit()?;
            Ok(events.len())
        })
    }

    fn events_for_week(
        &self,
        week_key: &str,
        agent_name: Option<&str>,
    ) -> Result<Vec<Event>, StoreError> {
        self.with_conn(|conn| {
            let mut rows = Vec::new();
            match agent_name {
                Some(agent) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {EVENT_COLUMNS} FROM events
                         WHERE week_key = ?1 AND agent_name = ?2
                         ORDER BY agent_name, start_time"
                    ))?;
                    let mapped = stmt.query_map(params![week_key, agent], event_from_row)?;
                    for row in mapped {
                        rows.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {EVENT_COLUMNS} FROM events
                         WHERE week_key = ?1
                         ORDER BY agent_name, start_time"
                    ))?;
                    let mapped = stmt.query_map(params![week_key], event_from_row)?;
                    for row in mapped {
                        rows.push(row?);
                    }
                }
            }
            Ok(rows)
        })
    }

    fn unclassified_events(&self, week_key: Option<&str>) -> Result<Vec<Event>, StoreError> {
        self.with_conn(|conn| {
            let mut rows = Vec::new();
            match week_key {
                Some(week) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {EVENT_COLUMNS} FROM events
                         WHERE classification IS NULL AND week_key = ?1
                         ORDER BY agent_name, start_time"
                    ))?;
                    let mapped = stmt.query_map(params![week], event_from_row)?;
                    for row in mapped {
                        rows.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {EVENT_COLUMNS} FROM events
                         WHERE classification IS NULL
                         ORDER BY week_key, agent_name, start_time"
                    ))?;
                    let mapped = stmt.query_map([], event_from_row)?;
                    for row in mapped {
                        rows.push(row?);
                    }
                }
            }
            Ok(rows)
        })
    }

    fn set_classification(
        &self,
        event_id: &str,
        classification: Classification,
        confidence: f64,
        reasoning: &str,
    ) -> Result<(), StoreError> {
        self.with_write_retry(|conn| {
            conn.execute(
                "UPDATE events SET classification = ?1, confidence = ?2, ai_reasoning = ?3
                 WHERE id = ?4",
                params![classification.as_str(), confidence, reasoning, event_id],
            )?;
            Ok(())
        })
    }

    fn set_override(&self, event_id: &str, corrected: Classification) -> Result<(), StoreError> {
        self.with_write_retry(|conn| {
            let tx = conn.unchecked_transaction()?;
            let existing: Option<(String, Option<String>)> = tx
                .query_row(
                    "SELECT title, classification FROM events WHERE id = ?1",
                    params![event_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((title, prior)) = existing {
                tx.execute(
                    "UPDATE events SET override = ?1 WHERE id = ?2",
                    params![corrected.as_str(), event_id],
                )?;
                tx.execute(
                    "INSERT INTO overrides (
                         event_title, original_classification,
                         corrected_classification, created_at
                     ) VALUES (?1, ?2, ?3, ?4)",
                    params![title, prior, corrected.as_str(), Utc::now().to_rfc3339()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn agent_stats(&self, week_key: &str) -> Result<Vec<AgentStats>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT agent_name,
                        COUNT(*) AS total,
                        SUM(CASE WHEN COALESCE(override, classification) = 'sales'
                            THEN 1 ELSE 0 END) AS sales,
                        SUM(CASE WHEN COALESCE(override, classification) IS NULL
                            THEN 1 ELSE 0 END) AS unclassified
                 FROM events
                 WHERE week_key = ?1
                 GROUP BY agent_name
                 ORDER BY agent_name",
            )?;
            let mapped = stmt.query_map(params![week_key], |row| {
                Ok(AgentStats {
                    agent_name: row.get(0)?,
                    total: row.get(1)?,
                    sales: row.get(2)?,
                    unclassified: row.get(3)?,
                })
            })?;
            let mut stats = Vec::new();
            for row in mapped {
                stats.push(row?);
            }
            Ok(stats)
        })
    }

    fn week_status(&self, week_key: &str) -> Result<WeekStatus, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*),
                        SUM(CASE WHEN classification IS NOT NULL THEN 1 ELSE 0 END),
                        SUM(CASE WHEN COALESCE(override, classification) = 'sales'
                            THEN 1 ELSE 0 END)
                 FROM events WHERE week_key = ?1",
                params![week_key],
                |row| {
                    let total: u32 = row.get(0)?;
                    let classified: u32 = row.get::<_, Option<u32>>(1)?.unwrap_or(0);
                    let sales: u32 = row.get::<_, Option<u32>>(2)?.unwrap_or(0);
                    Ok(WeekStatus {
                        week: week_key.to_string(),
                        total,
                        classified,
                        sales,
                        unclassified: total - classified,
                    })
                },
            )
        })
    }

    fn recent_overrides(&self, limit: u32) -> Result<Vec<OverrideRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_title, original_classification,
                        corrected_classification, created_at
                 FROM overrides
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?1",
            )?;
            let mapped = stmt.query_map(params![limit], |row| {
                Ok(OverrideRecord {
                    id: row.get(0)?,
                    event_title: row.get(1)?,
                    original_classification: row
                        .get::<_, Option<String>>(2)?
                        .as_deref()
                        .and_then(Classification::parse),
                    corrected_classification: Classification::normalize(
                        &row.get::<_, String>(3)?,
                    ),
                    created_at: row.get(4)?,
                })
            })?;
            let mut records = Vec::new();
            for row in mapped {
                records.push(row?);
            }
            Ok(records)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
