//! Manager feedback loop.
//!
//! Overrides are recorded twice: on the event itself (display wins) and
//! in an append-only log that feeds the oracle's instructions on later
//! runs, so corrections teach the classifier without retraining anything.

use std::sync::Arc;

use crate::store::{EventStore, StoreError};
use crate::types::{Classification, CorrectionExample};

/// How many recent corrections are folded into the oracle's prompt.
pub const DEFAULT_EXAMPLE_LIMIT: u32 = 20;

#[derive(Clone)]
pub struct FeedbackLoop {
    store: Arc<dyn EventStore>,
}

impl FeedbackLoop {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Record a correction for `event_id`. Unknown ids are ignored by
    /// the store; the caller gets an ack either way.
    pub fn record_override(
        &self,
        event_id: &str,
        corrected: Classification,
    ) -> Result<(), StoreError> {
        self.store.set_override(event_id, corrected)
    }

    /// The newest corrections, rendered for prompt construction.
    pub fn examples(&self, limit: u32) -> Result<Vec<CorrectionExample>, StoreError> {
        let records = self.store.recent_overrides(limit)?;
        Ok(records
            .into_iter()
            .map(|record| CorrectionExample {
                title: record.event_title,
                corrected: record.corrected_classification,
            })
            .collect())
    }
}
