//! Pipeline facade.
//!
//! One object owning the store, the scheduler, and the feedback loop,
//! exposing the operations a host (HTTP layer, CLI, desktop shell)
//! forwards to: ingest, trigger classification, observe progress,
//! record overrides, and read weekly views.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::feedback::FeedbackLoop;
use crate::ingest;
use crate::oracle::Classifier;
use crate::scheduler::{Scheduler, StartOutcome};
use crate::store::{AgentStats, EventStore, OverrideRecord, StoreError, WeekStatus};
use crate::types::{Classification, Event};
use crate::weeks;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid week key: {0}")]
    InvalidWeekKey(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of an ingestion call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub synced: usize,
    pub rejected: usize,
    pub week: String,
}

/// Outcome of ingesting pre-classified events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedIngestSummary {
    pub synced: usize,
    pub classified: usize,
    pub week: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifyStatus {
    Started,
    AlreadyRunning,
    Done,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifyStart {
    pub status: ClassifyStatus,
    pub total: usize,
}

/// Progress of the background job plus a fresh count of events still
/// lacking a verdict in the requested week.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub running: bool,
    pub done: usize,
    pub total: usize,
    pub current: String,
    pub remaining: usize,
}

/// Week view filter, applied to the effective classification.
/// `Other` selects events settled as not sales; unclassified events only
/// appear under `All`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Sales,
    Other,
}

pub struct Pipeline {
    store: Arc<dyn EventStore>,
    scheduler: Scheduler,
    feedback: FeedbackLoop,
}

impl Pipeline {
    pub fn new(store: Arc<dyn EventStore>, oracle: Arc<dyn Classifier>) -> Self {
        let scheduler = Scheduler::new(store.clone(), oracle);
        Self::with_scheduler(store, scheduler)
    }

    /// Assemble from parts, for hosts (and tests) that tune the
    /// scheduler first.
    pub fn with_scheduler(store: Arc<dyn EventStore>, scheduler: Scheduler) -> Self {
        Self {
            feedback: FeedbackLoop::new(store.clone()),
            store,
            scheduler,
        }
    }

    fn check_week(&self, week_key: &str) -> Result<(), PipelineError> {
        if weeks::is_valid_week_key(week_key) {
            Ok(())
        } else {
            Err(PipelineError::InvalidWeekKey(week_key.to_string()))
        }
    }

    /// Ingest raw calendar events into `week_key`. Malformed entries are
    /// counted and skipped, never fatal for the batch.
    pub fn ingest(&self, week_key: &str, raw: &[Value]) -> Result<IngestSummary, PipelineError> {
        self.check_week(week_key)?;

        let mut events = Vec::with_capacity(raw.len());
        let mut rejected = 0usize;
        for entry in raw {
            match ingest::resolve(entry, week_key) {
                Ok(event) => events.push(event),
                Err(err) => {
                    log::warn!("ingest: skipping entry for {week_key}: {err}");
                    rejected += 1;
                }
            }
        }

        let synced = self.store.upsert_events_bulk(&events)?;
        log::info!("ingest: {synced} events synced to {week_key} ({rejected} rejected)");
        Ok(IngestSummary {
            synced,
            rejected,
            week: week_key.to_string(),
        })
    }

    /// Ingest events that arrive with verdicts already attached, e.g.
    /// from an export of another deployment. Events without a
    /// classification field are stored unclassified.
    pub fn ingest_classified(
        &self,
        week_key: &str,
        raw: &[Value],
    ) -> Result<ClassifiedIngestSummary, PipelineError> {
        self.check_week(week_key)?;

        let mut resolved = Vec::with_capacity(raw.len());
        for entry in raw {
            match ingest::resolve(entry, week_key) {
                Ok(event) => resolved.push((event, entry)),
                Err(err) => log::warn!("ingest: skipping entry for {week_key}: {err}"),
            }
        }

        let events: Vec<Event> = resolved.iter().map(|(event, _)| event.clone()).collect();
        let synced = self.store.upsert_events_bulk(&events)?;

        let mut classified = 0usize;
        for (event, entry) in &resolved {
            let Some(label) = entry.get("classification").and_then(Value::as_str) else {
                continue;
            };
            if label.is_empty() {
                continue;
            }
            let confidence = entry
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let reasoning = entry
                .get("reasoning")
                .or_else(|| entry.get("aiReasoning"))
                .or_else(|| entry.get("ai_reasoning"))
                .and_then(Value::as_str)
                .unwrap_or("");
            self.store.set_classification(
                &event.id,
                Classification::normalize(label),
                confidence,
                reasoning,
            )?;
            classified += 1;
        }

        log::info!(
            "ingest: {synced} pre-classified events synced to {week_key} ({classified} with verdicts)"
        );
        Ok(ClassifiedIngestSummary {
            synced,
            classified,
            week: week_key.to_string(),
        })
    }

    /// Kick off background classification for a week. Returns `Done`
    /// without starting anything when an incremental run has no work.
    pub fn trigger_classification(
        &self,
        week_key: &str,
        reclassify_all: bool,
    ) -> Result<ClassifyStart, PipelineError> {
        self.check_week(week_key)?;

        if !reclassify_all {
            let pending = self.store.unclassified_events(Some(week_key))?;
            if pending.is_empty() {
                return Ok(ClassifyStart {
                    status: ClassifyStatus::Done,
                    total: 0,
                });
            }
        }

        match self.scheduler.start(week_key, reclassify_all)? {
            StartOutcome::Started { total } => Ok(ClassifyStart {
                status: ClassifyStatus::Started,
                total,
            }),
            StartOutcome::AlreadyRunning => Ok(ClassifyStart {
                status: ClassifyStatus::AlreadyRunning,
                total: self.scheduler.progress().total,
            }),
        }
    }

    pub fn classification_progress(
        &self,
        week_key: &str,
    ) -> Result<ProgressReport, PipelineError> {
        self.check_week(week_key)?;
        let progress = self.scheduler.progress();
        let remaining = self.store.unclassified_events(Some(week_key))?.len();
        Ok(ProgressReport {
            running: progress.running,
            done: progress.done,
            total: progress.total,
            current: progress.current,
            remaining,
        })
    }

    /// Record a manager correction. Unknown event ids are acknowledged
    /// silently.
    pub fn record_override(
        &self,
        event_id: &str,
        corrected: Classification,
    ) -> Result<(), PipelineError> {
        self.feedback.record_override(event_id, corrected)?;
        Ok(())
    }

    pub fn week_status(&self, week_key: &str) -> Result<WeekStatus, PipelineError> {
        self.check_week(week_key)?;
        Ok(self.store.week_status(week_key)?)
    }

    pub fn agent_stats(&self, week_key: &str) -> Result<Vec<AgentStats>, PipelineError> {
        self.check_week(week_key)?;
        Ok(self.store.agent_stats(week_key)?)
    }

    pub fn events_for_week(
        &self,
        week_key: &str,
        agent_name: Option<&str>,
    ) -> Result<Vec<Event>, PipelineError> {
        self.check_week(week_key)?;
        Ok(self.store.events_for_week(week_key, agent_name)?)
    }

    /// Week view filtered by effective classification.
    pub fn week_events(
        &self,
        week_key: &str,
        filter: EventFilter,
    ) -> Result<Vec<Event>, PipelineError> {
        let events = self.events_for_week(week_key, None)?;
        Ok(events
            .into_iter()
            .filter(|event| match filter {
                EventFilter::All => true,
                EventFilter::Sales => {
                    event.effective_classification() == Some(Classification::Sales)
                }
                EventFilter::Other => {
                    event.effective_classification() == Some(Classification::NotSales)
                }
            })
            .collect())
    }

    pub fn recent_overrides(&self, limit: u32) -> Result<Vec<OverrideRecord>, PipelineError> {
        Ok(self.store.recent_overrides(limit)?)
    }
}
