//! Shared domain types.

use serde::{Deserialize, Serialize};

/// The two labels the classification oracle may assign to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Sales,
    NotSales,
}

impl Classification {
    /// Lenient parse for oracle output. Any label outside the two
    /// recognized values maps to `NotSales`.
    pub fn normalize(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "sales" => Classification::Sales,
            _ => Classification::NotSales,
        }
    }

    /// Strict parse for stored column values.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sales" => Some(Classification::Sales),
            "not_sales" => Some(Classification::NotSales),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Sales => "sales",
            Classification::NotSales => "not_sales",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deduplicated calendar event.
///
/// Identity is the fingerprint in `id`; uniqueness is enforced by the
/// store on `(agent_name, title, start_time, week_key)`. Timestamps are
/// opaque strings as delivered by the calendar source.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub agent_name: String,
    pub title: String,
    pub start_time: String,
    pub end_time: String,
    pub description: String,
    pub location: String,
    pub week_key: String,
    pub is_all_day: bool,
    pub status: String,
    pub classification: Option<Classification>,
    pub confidence: Option<f64>,
    pub ai_reasoning: String,
    #[serde(rename = "override")]
    pub override_classification: Option<Classification>,
    pub created_at: String,
}

impl Event {
    /// The classification downstream consumers should use: a manager
    /// override wins over the oracle's label; `None` means unclassified.
    pub fn effective_classification(&self) -> Option<Classification> {
        self.override_classification.or(self.classification)
    }
}

/// One verdict from the classification oracle.
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub id: String,
    pub classification: Classification,
    pub confidence: f64,
    pub reasoning: String,
}

/// A manager correction rendered for the oracle's instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionExample {
    pub title: String,
    pub corrected: Classification,
}
