//! Run records and the ordered run history of a search.

use chrono::{DateTime, Utc};
use ct_types::Configuration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a single objective evaluation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// The objective returned a cost (possibly infinite).
    Success,
    /// The objective failed to return.
    Crashed,
    /// The objective exceeded its wall-clock limit.
    Timeout,
}

/// One evaluated configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord<I> {
    pub id: Uuid,
    pub trial_number: usize,
    pub configuration: Configuration,
    /// Cost in objective units. Crashed runs carry the worst possible cost.
    #[serde(with = "ct_types::float_serde")]
    pub cost: f64,
    pub status: RunStatus,
    pub additional_info: Option<I>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl<I> RunRecord<I> {
    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Append-only, evaluation-ordered history of a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHistory<I> {
    records: Vec<RunRecord<I>>,
}

impl<I> Default for RunHistory<I> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
        }
    }
}

impl<I> RunHistory<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: RunRecord<I>) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[RunRecord<I>] {
        &self.records
    }

    pub fn into_records(self) -> Vec<RunRecord<I>> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, cfg: &Configuration) -> bool {
        self.records.iter().any(|r| &r.configuration == cfg)
    }

    pub fn num_failed(&self) -> usize {
        self.records.iter().filter(|r| !r.is_success()).count()
    }

    /// Successful record with the lowest `loss`, earliest on ties.
    pub fn best_by<F>(&self, loss: F) -> Option<&RunRecord<I>>
    where
        F: Fn(&RunRecord<I>) -> f64,
    {
        let mut best: Option<(&RunRecord<I>, f64)> = None;
        for record in self.records.iter().filter(|r| r.is_success()) {
            let value = loss(record);
            if value.is_nan() {
                continue;
            }
            match best {
                Some((_, current)) if value >= current => {}
                _ => best = Some((record, value)),
            }
        }
        best.map(|(record, _)| record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize, cost: f64, status: RunStatus) -> RunRecord<()> {
        let now = Utc::now();
        RunRecord {
            id: Uuid::new_v4(),
            trial_number: n,
            configuration: Configuration::new().with("x", n as i64),
            cost,
            status,
            additional_info: None,
            error: None,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn best_skips_failures_and_prefers_earliest() {
        let mut history = RunHistory::new();
        history.push(record(0, 3.0, RunStatus::Success));
        history.push(record(1, 1.0, RunStatus::Success));
        history.push(record(2, 0.5, RunStatus::Crashed));
        history.push(record(3, 1.0, RunStatus::Success));

        let best = history.best_by(|r| r.cost).unwrap();
        assert_eq!(best.trial_number, 1);
        assert_eq!(history.num_failed(), 1);
        assert!(history.contains(&Configuration::new().with("x", 3i64)));
    }

    #[test]
    fn infinite_only_history_still_has_best() {
        let mut history = RunHistory::new();
        history.push(record(0, f64::INFINITY, RunStatus::Success));
        history.push(record(1, f64::INFINITY, RunStatus::Success));
        assert_eq!(history.best_by(|r| r.cost).unwrap().trial_number, 0);
    }

    #[test]
    fn crashed_cost_survives_json() {
        let mut history = RunHistory::new();
        history.push(record(0, f64::INFINITY, RunStatus::Crashed));
        let json = serde_json::to_string(&history).unwrap();
        let back: RunHistory<()> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.records()[0].cost, f64::INFINITY);
        assert_eq!(back.records()[0].status, RunStatus::Crashed);
    }

    #[test]
    fn record_lifecycle_duration() {
        let mut r = record(0, 1.0, RunStatus::Success);
        r.finished_at = r.started_at + chrono::Duration::milliseconds(1500);
        assert!((r.duration_seconds() - 1.5).abs() < 1e-9);
    }
}
