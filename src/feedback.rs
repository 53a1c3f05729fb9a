//! Post-hoc feedback on the examples a run used.
//!
//! Feedback is kept as an append-only event log per example. An example's
//! success rate is never edited in place: it is derived by replaying the
//! example's events over its stored base rate with an exponential moving
//! average, and the derived value is pushed into the store's overlay.
//! Updates to one example are serialized by holding its log entry while the
//! rate is recomputed and written.

use crate::error::ValidationError;
use crate::store::ExampleStore;
use crate::util::now_epoch_ms;
use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// User judgement of a generated script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Accepted,
    Rejected,
    Edited,
}

impl Outcome {
    /// Value the moving average is pulled toward.
    pub fn target(self) -> f64 {
        match self {
            Self::Accepted => 1.0,
            Self::Edited => 0.5,
            Self::Rejected => 0.0,
        }
    }
}

impl FromStr for Outcome {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "edited" => Ok(Self::Edited),
            _ => Err(ValidationError::UnknownOutcome(s.to_string())),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::Rejected => write!(f, "rejected"),
            Self::Edited => write!(f, "edited"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub example_id: String,
    pub outcome: Outcome,
    pub at_epoch_ms: u64,
}

/// New rate of one example after `record`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateUpdate {
    pub example_id: String,
    pub previous_rate: f64,
    pub rate: f64,
}

/// Replay `events` over `base` with learning rate `lr`.
pub fn derived_rate<'a>(
    base: f64,
    events: impl IntoIterator<Item = &'a FeedbackEvent>,
    lr: f64,
) -> f64 {
    events
        .into_iter()
        .fold(base, |rate, event| rate + lr * (event.outcome.target() - rate))
        .clamp(0.0, 1.0)
}

pub struct FeedbackTracker {
    store: Arc<dyn ExampleStore>,
    learning_rate: f64,
    events: DashMap<String, Vec<FeedbackEvent>>,
}

impl FeedbackTracker {
    pub fn new(store: Arc<dyn ExampleStore>, learning_rate: f64) -> Result<Self, ValidationError> {
        if !(learning_rate > 0.0 && learning_rate <= 1.0) {
            return Err(ValidationError::LearningRate(learning_rate));
        }
        Ok(Self {
            store,
            learning_rate,
            events: DashMap::new(),
        })
    }

    /// Record one outcome for every example a run used.
    ///
    /// All ids are checked before anything is applied, so a bad id leaves
    /// every rate untouched.
    pub fn record(
        &self,
        example_ids: &[String],
        outcome: Outcome,
    ) -> Result<Vec<RateUpdate>, ValidationError> {
        if example_ids.is_empty() {
            return Err(ValidationError::NoExamples);
        }
        if let Some(unknown) = example_ids
            .iter()
            .find(|id| self.store.base_success_rate(id).is_none())
        {
            return Err(ValidationError::UnknownExample(unknown.clone()));
        }

        let at_epoch_ms = now_epoch_ms();
        let mut ids: Vec<&String> = example_ids.iter().collect();
        ids.sort();
        ids.dedup();
        let mut updates = Vec::with_capacity(ids.len());
        for id in ids {
            let update = self.apply(FeedbackEvent {
                example_id: id.clone(),
                outcome,
                at_epoch_ms,
            })?;
            updates.push(update);
        }
        Ok(updates)
    }

    /// Re-apply previously persisted events, e.g. from the feedback log.
    /// Events for ids the store does not know are skipped with a warning.
    pub fn replay(&self, events: impl IntoIterator<Item = FeedbackEvent>) -> Result<usize, ValidationError> {
        let mut applied = 0;
        for event in events {
            if self.store.base_success_rate(&event.example_id).is_none() {
                tracing::warn!(example_id = %event.example_id, "skip feedback for unknown example");
                continue;
            }
            self.apply(event)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Events recorded for `example_id`, oldest first.
    pub fn events_for(&self, example_id: &str) -> Vec<FeedbackEvent> {
        self.events
            .get(example_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn apply(&self, event: FeedbackEvent) -> Result<RateUpdate, ValidationError> {
        let id = event.example_id.clone();
        let base = self
            .store
            .base_success_rate(&id)
            .ok_or_else(|| ValidationError::UnknownExample(id.clone()))?;

        // The entry guard serializes append, replay and write for this example.
        let mut entry = self.events.entry(id.clone()).or_default();
        let previous_rate = derived_rate(base, entry.iter(), self.learning_rate);
        entry.push(event);
        let rate = derived_rate(base, entry.iter(), self.learning_rate);
        self.store.update_success_rate(&id, rate)?;
        drop(entry);

        tracing::info!(example_id = %id, previous_rate, rate, "feedback applied");
        Ok(RateUpdate {
            example_id: id,
            previous_rate,
            rate,
        })
    }
}

/// Feedback log kept next to a store file: `<store>.feedback.jsonl`.
pub fn feedback_log_path(store_path: &Path) -> PathBuf {
    let mut name = store_path.as_os_str().to_os_string();
    name.push(".feedback.jsonl");
    PathBuf::from(name)
}

/// Read a feedback log; a missing file is an empty log and corrupt lines are
/// skipped with a warning.
pub fn load_feedback_log(path: &Path) -> Result<Vec<FeedbackEvent>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("open feedback log {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read line {} of feedback log", line_num + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FeedbackEvent>(&line) {
            Ok(event) => events.push(event),
            Err(err) => {
                tracing::warn!(line = line_num + 1, error = %err, "skip corrupt feedback event");
            }
        }
    }
    Ok(events)
}

pub fn append_feedback_log(path: &Path, events: &[FeedbackEvent]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    for event in events {
        let line = serde_json::to_string(event).context("serialize feedback event")?;
        writeln!(file, "{line}").with_context(|| format!("append {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Example, InMemoryExampleStore};
    use std::collections::BTreeSet;
    use std::thread;

    fn store() -> Arc<InMemoryExampleStore> {
        let examples = ["ex-0001", "ex-0002"]
            .into_iter()
            .map(|id| Example {
                id: id.to_string(),
                request_text: "dealer airtime commission".to_string(),
                sql_text: "SELECT 1 FROM dual;".to_string(),
                embedding: vec![1.0, 0.0],
                tags: BTreeSet::new(),
                historical_success_rate: 0.5,
                last_used_at: None,
                supporting_schema: None,
            })
            .collect();
        Arc::new(InMemoryExampleStore::new("fixed", 2, examples))
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn outcome_parsing_rejects_unknown_values() {
        assert_eq!("ACCEPTED".parse::<Outcome>(), Ok(Outcome::Accepted));
        assert_eq!(" edited ".parse::<Outcome>(), Ok(Outcome::Edited));
        assert_eq!(
            "maybe".parse::<Outcome>(),
            Err(ValidationError::UnknownOutcome("maybe".to_string()))
        );
    }

    #[test]
    fn accepted_moves_rate_toward_one() {
        let store = store();
        let tracker = FeedbackTracker::new(store.clone(), 0.2).expect("tracker");
        let updates = tracker
            .record(&ids(&["ex-0001"]), Outcome::Accepted)
            .expect("record");
        assert_eq!(updates.len(), 1);
        assert!((updates[0].rate - 0.6).abs() < 1e-9);
        let example = store.get("ex-0001").expect("example");
        assert!((example.historical_success_rate - 0.6).abs() < 1e-9);
        assert!((store.base_success_rate("ex-0001").expect("base") - 0.5).abs() < 1e-12);
    }

    #[test]
    fn bad_feedback_applies_nothing() {
        let store = store();
        let tracker = FeedbackTracker::new(store.clone(), 0.2).expect("tracker");
        assert_eq!(
            tracker.record(&[], Outcome::Accepted),
            Err(ValidationError::NoExamples)
        );
        assert_eq!(
            tracker.record(&ids(&["ex-0001", "ex-9999"]), Outcome::Rejected),
            Err(ValidationError::UnknownExample("ex-9999".to_string()))
        );
        assert!(tracker.events_for("ex-0001").is_empty());
        let example = store.get("ex-0001").expect("example");
        assert!((example.historical_success_rate - 0.5).abs() < 1e-12);
    }

    #[test]
    fn learning_rate_is_bounded() {
        assert!(FeedbackTracker::new(store(), 0.0).is_err());
        assert!(FeedbackTracker::new(store(), 1.5).is_err());
        assert!(FeedbackTracker::new(store(), 1.0).is_ok());
    }

    #[test]
    fn concurrent_updates_are_never_lost() {
        for _ in 0..50 {
            let store = store();
            let tracker = Arc::new(FeedbackTracker::new(store.clone(), 0.2).expect("tracker"));
            let handles: Vec<_> = [Outcome::Accepted, Outcome::Rejected]
                .into_iter()
                .map(|outcome| {
                    let tracker = Arc::clone(&tracker);
                    thread::spawn(move || {
                        tracker
                            .record(&ids(&["ex-0001"]), outcome)
                            .expect("record");
                    })
                })
                .collect();
            for handle in handles {
                handle.join().expect("join");
            }

            let rate = store
                .get("ex-0001")
                .expect("example")
                .historical_success_rate;
            // accepted then rejected: 0.48; rejected then accepted: 0.52
            let serial = [0.48, 0.52];
            assert!(
                serial.iter().any(|expected| (rate - expected).abs() < 1e-9),
                "rate {rate} is not a serial outcome"
            );
            assert_eq!(tracker.events_for("ex-0001").len(), 2);
        }
    }

    #[test]
    fn derived_rate_matches_replay_order() {
        let event = |outcome| FeedbackEvent {
            example_id: "ex-0001".to_string(),
            outcome,
            at_epoch_ms: 0,
        };
        let events = [event(Outcome::Rejected), event(Outcome::Edited)];
        // 0.5 -> 0.4 -> 0.42
        assert!((derived_rate(0.5, events.iter(), 0.2) - 0.42).abs() < 1e-9);
        assert!((derived_rate(0.5, std::iter::empty(), 0.2) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn feedback_log_round_trips_and_replays() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store_path = dir.path().join("store.json");
        let log = feedback_log_path(&store_path);
        assert!(log.ends_with("store.json.feedback.jsonl"));

        let first = store();
        let tracker = FeedbackTracker::new(first, 0.2).expect("tracker");
        tracker
            .record(&ids(&["ex-0002"]), Outcome::Rejected)
            .expect("record");
        append_feedback_log(&log, &tracker.events_for("ex-0002")).expect("append");
        fs::OpenOptions::new()
            .append(true)
            .open(&log)
            .and_then(|mut f| writeln!(f, "{{not json"))
            .expect("corrupt line");

        let events = load_feedback_log(&log).expect("load");
        assert_eq!(events.len(), 1);

        let fresh = store();
        let replayed = FeedbackTracker::new(fresh.clone(), 0.2).expect("tracker");
        assert_eq!(replayed.replay(events).expect("replay"), 1);
        let rate = fresh.get("ex-0002").expect("example").historical_success_rate;
        assert!((rate - 0.4).abs() < 1e-9);
    }

    #[test]
    fn missing_log_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let events = load_feedback_log(&dir.path().join("absent.jsonl")).expect("load");
        assert!(events.is_empty());
    }
}
