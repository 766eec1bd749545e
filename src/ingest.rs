//! Raw calendar event normalization and identity resolution.
//!
//! Calendar sources deliver loosely-typed JSON records with inconsistent
//! field names. This module maps them onto canonical [`Event`] records
//! through a fixed alias table and derives each event's stable
//! fingerprint. Pure transforms, no I/O.

use chrono::Utc;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::Event;

/// Errors rejecting a single raw event. Ingestion continues with the
/// rest of the batch.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("raw event is not a JSON object")]
    NotAnObject,
}

// Field alias table: first present, non-null alias wins. Absent or null
// fields take the documented defaults below.
const AGENT_ALIASES: &[&str] = &["agent", "agent_name", "agentName"];
const TITLE_ALIASES: &[&str] = &["title", "summary"];
const START_ALIASES: &[&str] = &["start", "start_time", "startTime"];
const END_ALIASES: &[&str] = &["end", "end_time", "endTime"];
const DESCRIPTION_ALIASES: &[&str] = &["description"];
const LOCATION_ALIASES: &[&str] = &["location"];
const ALL_DAY_ALIASES: &[&str] = &["allDay", "all_day", "is_all_day", "isAllDay"];
const STATUS_ALIASES: &[&str] = &["status"];

const DEFAULT_AGENT: &str = "Unknown";
const DEFAULT_TITLE: &str = "(No Title)";
const DEFAULT_STATUS: &str = "confirmed";

/// Deterministic content hash identifying an event across independent
/// re-derivations. Field order is fixed: agent, then start, then title.
pub fn fingerprint(agent: &str, start: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent.as_bytes());
    hasher.update(b"_");
    hasher.update(start.as_bytes());
    hasher.update(b"_");
    hasher.update(title.as_bytes());
    hex::encode(hasher.finalize())
}

/// Resolve a raw event into a canonical [`Event`] for `week_key`.
///
/// Classification fields start unset; the store's conflict handling
/// decides what an existing row keeps on re-ingestion.
pub fn resolve(raw: &Value, week_key: &str) -> Result<Event, IngestError> {
    let obj = raw.as_object().ok_or(IngestError::NotAnObject)?;

    let agent_name =
        string_field(obj, AGENT_ALIASES).unwrap_or_else(|| DEFAULT_AGENT.to_string());
    let title = string_field(obj, TITLE_ALIASES).unwrap_or_else(|| DEFAULT_TITLE.to_string());
    let start_time = string_field(obj, START_ALIASES).unwrap_or_default();
    let end_time = string_field(obj, END_ALIASES).unwrap_or_default();
    let description = string_field(obj, DESCRIPTION_ALIASES).unwrap_or_default();
    let location = string_field(obj, LOCATION_ALIASES).unwrap_or_default();
    let is_all_day = bool_field(obj, ALL_DAY_ALIASES).unwrap_or(false);
    let status = string_field(obj, STATUS_ALIASES).unwrap_or_else(|| DEFAULT_STATUS.to_string());

    Ok(Event {
        id: fingerprint(&agent_name, &start_time, &title),
        agent_name,
        title,
        start_time,
        end_time,
        description,
        location,
        week_key: week_key.to_string(),
        is_all_day,
        status,
        classification: None,
        confidence: None,
        ai_reasoning: String::new(),
        override_classification: None,
        created_at: Utc::now().to_rfc3339(),
    })
}

fn string_field(obj: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    for key in aliases {
        match obj.get(*key) {
            Some(Value::String(s)) => return Some(s.clone()),
            Some(Value::Null) | None => continue,
            Some(other) => return Some(other.to_string()),
        }
    }
    None
}

fn bool_field(obj: &Map<String, Value>, aliases: &[&str]) -> Option<bool> {
    for key in aliases {
        match obj.get(*key) {
            Some(Value::Bool(b)) => return Some(*b),
            Some(Value::Number(n)) => match n.as_i64() {
                Some(1) => return Some(true),
                Some(0) => return Some(false),
                _ => continue,
            },
            Some(Value::String(s)) => match s.to_lowercase().as_str() {
                "true" | "1" | "yes" => return Some(true),
                "false" | "0" | "no" => return Some(false),
                _ => continue,
            },
            Some(Value::Null) | None => continue,
            Some(_) => continue,
        }
    }
    None
}
