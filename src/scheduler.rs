//! Background classification scheduler.
//!
//! One classification job runs at a time. Starting is a synchronous
//! compare-and-set on the owned [`ProgressCell`]; the job itself runs on
//! a spawned task, working through the target list in batches and
//! publishing progress after every step. A failed oracle call defers
//! that batch (the events simply stay unclassified for the next run); a
//! failed store write aborts the job with an error label in the
//! progress line.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::feedback::{FeedbackLoop, DEFAULT_EXAMPLE_LIMIT};
use crate::oracle::Classifier;
use crate::store::{EventStore, StoreError};
use crate::types::Event;

pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const INTER_BATCH_PAUSE_MS: u64 = 1_000;
const ERROR_LABEL_MAX_LEN: usize = 100;

/// Observable state of the classification job.
///
/// `done` counts persisted verdicts, not attempted events, so a deferred
/// batch leaves it unchanged. A fresh process starts idle.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub running: bool,
    pub done: usize,
    pub total: usize,
    pub current: String,
}

/// Shared, owned progress state. Cloning shares the cell.
#[derive(Clone, Default)]
pub struct ProgressCell {
    inner: Arc<Mutex<Progress>>,
}

impl ProgressCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking read; a poisoned lock reads as idle.
    pub fn snapshot(&self) -> Progress {
        self.inner
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn store(&self, progress: Progress) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = progress;
        }
    }

    /// Claim the running flag. Returns false if a job already holds it.
    fn try_begin(&self) -> bool {
        let Ok(mut guard) = self.inner.lock() else {
            return false;
        };
        if guard.running {
            return false;
        }
        *guard = Progress {
            running: true,
            done: 0,
            total: 0,
            current: "starting...".to_string(),
        };
        true
    }
}

/// Result of asking the scheduler to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { total: usize },
    AlreadyRunning,
}

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn EventStore>,
    oracle: Arc<dyn Classifier>,
    feedback: FeedbackLoop,
    progress: ProgressCell,
    batch_size: usize,
    example_limit: u32,
    pause: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn EventStore>, oracle: Arc<dyn Classifier>) -> Self {
        Self {
            feedback: FeedbackLoop::new(store.clone()),
            store,
            oracle,
            progress: ProgressCell::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            example_limit: DEFAULT_EXAMPLE_LIMIT,
            pause: Duration::from_millis(INTER_BATCH_PAUSE_MS),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_example_limit(mut self, limit: u32) -> Self {
        self.example_limit = limit;
        self
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn progress(&self) -> Progress {
        self.progress.snapshot()
    }

    /// Start a classification job for one week. Must be called from
    /// within a Tokio runtime; the job runs on a spawned task.
    ///
    /// With `reclassify_all` the job revisits every event in the week,
    /// otherwise only events without a verdict.
    pub fn start(&self, week_key: &str, reclassify_all: bool) -> Result<StartOutcome, StoreError> {
        if !self.progress.try_begin() {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let targets = if reclassify_all {
            self.store.events_for_week(week_key, None)
        } else {
            self.store.unclassified_events(Some(week_key))
        };
        let targets = match targets {
            Ok(targets) => targets,
            Err(err) => {
                self.progress.store(Progress {
                    running: false,
                    done: 0,
                    total: 0,
                    current: error_label(&err.to_string()),
                });
                return Err(err);
            }
        };

        let total = targets.len();
        log::info!("scheduler: starting classification of {total} events for {week_key}");
        self.progress.store(Progress {
            running: true,
            done: 0,
            total,
            current: "starting...".to_string(),
        });

        let job = self.clone();
        tokio::spawn(async move { job.run(targets).await });

        Ok(StartOutcome::Started { total })
    }

    async fn run(self, targets: Vec<Event>) {
        let total = targets.len();
        let mut done = 0usize;

        for (index, chunk) in targets.chunks(self.batch_size).enumerate() {
            let batch_no = index + 1;
            self.progress.store(Progress {
                running: true,
                done,
                total,
                current: format!("Batch {batch_no}..."),
            });

            // Re-read corrections each batch so overrides recorded
            // mid-run influence the remaining batches.
            let examples = match self.feedback.examples(self.example_limit) {
                Ok(examples) => examples,
                Err(err) => {
                    log::warn!("scheduler: failed to load correction examples: {err}");
                    Vec::new()
                }
            };

            let results = match self.oracle.classify(chunk, &examples).await {
                Ok(results) => results,
                Err(err) => {
                    log::warn!(
                        "scheduler: batch {batch_no} deferred after oracle error: {err}"
                    );
                    Vec::new()
                }
            };

            let mut persisted = 0usize;
            let mut write_error = None;
            for result in results {
                match self.store.set_classification(
                    &result.id,
                    result.classification,
                    result.confidence,
                    &result.reasoning,
                ) {
                    Ok(()) => persisted += 1,
                    Err(err) => {
                        write_error = Some(err);
                        break;
                    }
                }
            }
            done += persisted;

            if let Some(err) = write_error {
                log::error!("scheduler: aborting run, storage failed: {err}");
                self.progress.store(Progress {
                    running: false,
                    done,
                    total,
                    current: error_label(&err.to_string()),
                });
                return;
            }

            self.progress.store(Progress {
                running: true,
                done,
                total,
                current: format!("Batch {batch_no} complete"),
            });

            if !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }

        log::info!("scheduler: classification complete ({done}/{total} persisted)");
        self.progress.store(Progress {
            running: false,
            done,
            total,
            current: "complete".to_string(),
        });
    }
}

fn error_label(message: &str) -> String {
    let truncated: String = message.chars().take(ERROR_LABEL_MAX_LEN).collect();
    format!("error: {truncated}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest;
    use crate::oracle::OracleError;
    use crate::store::SqliteStore;
    use crate::types::{Classification, ClassificationResult, CorrectionExample};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    /// Classifies by title lookup and records the examples it was shown.
    struct RuleClassifier {
        rules: HashMap<String, Classification>,
        seen_examples: Mutex<Vec<Vec<CorrectionExample>>>,
        fail: bool,
    }

    impl RuleClassifier {
        fn new(rules: &[(&str, Classification)]) -> Self {
            Self {
                rules: rules
                    .iter()
                    .map(|(title, label)| (title.to_string(), *label))
                    .collect(),
                seen_examples: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing() -> Self {
            let mut classifier = Self::new(&[]);
            classifier.fail = true;
            classifier
        }
    }

    #[async_trait]
    impl Classifier for RuleClassifier {
        async fn classify(
            &self,
            batch: &[Event],
            examples: &[CorrectionExample],
        ) -> Result<Vec<ClassificationResult>, OracleError> {
            if self.fail {
                return Err(OracleError::Api {
                    status: 503,
                    message: "oracle down".to_string(),
                });
            }
            self.seen_examples.lock().unwrap().push(examples.to_vec());
            Ok(batch
                .iter()
                .map(|event| ClassificationResult {
                    id: event.id.clone(),
                    classification: self
                        .rules
                        .get(&event.title)
                        .copied()
                        .unwrap_or(Classification::NotSales),
                    confidence: 0.9,
                    reasoning: "rule".to_string(),
                })
                .collect())
        }
    }

    fn test_store_with_events(titles: &[&str]) -> Arc<SqliteStore> {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test_events.db");
        std::mem::forget(dir);
        let store = Arc::new(SqliteStore::open_at(path).expect("Failed to open test database"));
        for (i, title) in titles.iter().enumerate() {
            let event = ingest::resolve(
                &json!({
                    "agent": "Pat",
                    "title": title,
                    "start": format!("2026-02-09T{:02}:00:00", 9 + i)
                }),
                "2026-W07",
            )
            .unwrap();
            store.upsert_event(&event).unwrap();
        }
        store
    }

    async fn wait_until_idle(scheduler: &Scheduler) -> Progress {
        for _ in 0..500 {
            let progress = scheduler.progress();
            if !progress.running {
                return progress;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("classification job did not finish");
    }

    #[tokio::test]
    async fn test_full_run_persists_verdicts() {
        let store = test_store_with_events(&["Client call", "Standup", "Lunch"]);
        let oracle = Arc::new(RuleClassifier::new(&[
            ("Client call", Classification::Sales),
            ("Standup", Classification::NotSales),
        ]));
        let scheduler = Scheduler::new(store.clone(), oracle)
            .with_batch_size(2)
            .with_pause(Duration::ZERO);

        let outcome = scheduler.start("2026-W07", false).unwrap();
        assert_eq!(outcome, StartOutcome::Started { total: 3 });

        let progress = wait_until_idle(&scheduler).await;
        assert_eq!(progress.done, 3);
        assert_eq!(progress.total, 3);
        assert_eq!(progress.current, "complete");

        assert!(store.unclassified_events(Some("2026-W07")).unwrap().is_empty());
        let events = store.events_for_week("2026-W07", None).unwrap();
        let sales: Vec<&str> = events
            .iter()
            .filter(|e| e.classification == Some(Classification::Sales))
            .map(|e| e.title.as_str())
            .collect();
        assert_eq!(sales, vec!["Client call"]);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let store = test_store_with_events(&["A", "B", "C"]);
        let oracle = Arc::new(RuleClassifier::new(&[]));
        let scheduler = Scheduler::new(store, oracle)
            .with_batch_size(1)
            .with_pause(Duration::from_millis(50));

        assert!(matches!(
            scheduler.start("2026-W07", false).unwrap(),
            StartOutcome::Started { total: 3 }
        ));
        // The running flag is claimed before start() returns
        assert_eq!(
            scheduler.start("2026-W07", false).unwrap(),
            StartOutcome::AlreadyRunning
        );

        wait_until_idle(&scheduler).await;
        // Idle again: a new run may start
        assert!(matches!(
            scheduler.start("2026-W07", true).unwrap(),
            StartOutcome::Started { total: 3 }
        ));
        wait_until_idle(&scheduler).await;
    }

    #[tokio::test]
    async fn test_oracle_failure_defers_batch() {
        let store = test_store_with_events(&["A", "B"]);
        let oracle = Arc::new(RuleClassifier::failing());
        let scheduler =
            Scheduler::new(store.clone(), oracle).with_pause(Duration::ZERO);

        scheduler.start("2026-W07", false).unwrap();
        let progress = wait_until_idle(&scheduler).await;

        // Nothing persisted, but the job terminates cleanly
        assert_eq!(progress.done, 0);
        assert_eq!(progress.total, 2);
        assert_eq!(progress.current, "complete");
        assert_eq!(store.unclassified_events(Some("2026-W07")).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reclassify_all_revisits_classified_events() {
        let store = test_store_with_events(&["A"]);
        let oracle = Arc::new(RuleClassifier::new(&[("A", Classification::Sales)]));
        let scheduler =
            Scheduler::new(store.clone(), oracle).with_pause(Duration::ZERO);

        scheduler.start("2026-W07", false).unwrap();
        wait_until_idle(&scheduler).await;
        assert!(store.unclassified_events(Some("2026-W07")).unwrap().is_empty());

        // Incremental run now has nothing to do
        assert_eq!(
            scheduler.start("2026-W07", false).unwrap(),
            StartOutcome::Started { total: 0 }
        );
        wait_until_idle(&scheduler).await;

        // Full reclassification targets everything again
        assert_eq!(
            scheduler.start("2026-W07", true).unwrap(),
            StartOutcome::Started { total: 1 }
        );
        wait_until_idle(&scheduler).await;
    }

    #[tokio::test]
    async fn test_corrections_reach_the_oracle() {
        let store = test_store_with_events(&["Standup", "Client call"]);
        let events = store.events_for_week("2026-W07", None).unwrap();
        let standup = events.iter().find(|e| e.title == "Standup").unwrap();
        store
            .set_classification(&standup.id, Classification::NotSales, 0.8, "")
            .unwrap();
        store.set_override(&standup.id, Classification::Sales).unwrap();

        let oracle = Arc::new(RuleClassifier::new(&[]));
        let scheduler = Scheduler::new(store, oracle.clone()).with_pause(Duration::ZERO);
        scheduler.start("2026-W07", false).unwrap();
        wait_until_idle(&scheduler).await;

        let seen = oracle.seen_examples.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), 1);
        assert_eq!(seen[0][0].title, "Standup");
        assert_eq!(seen[0][0].corrected, Classification::Sales);
    }
}
