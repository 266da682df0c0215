//! Search scenario configuration and run lifecycle status.

use chrono::{DateTime, Utc};
use ct_types::SearchError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::history::RunRecord;

/// Unique search run identifier.
pub type ScenarioId = Uuid;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Minimize
    }
}

impl ObjectiveDirection {
    /// Map an objective value to a "lower is better" loss.
    pub fn loss(&self, cost: f64) -> f64 {
        match self {
            Self::Minimize => cost,
            Self::Maximize => -cost,
        }
    }

    /// Worst possible objective value, recorded for crashed runs.
    pub fn worst(&self) -> f64 {
        match self {
            Self::Minimize => f64::INFINITY,
            Self::Maximize => f64::NEG_INFINITY,
        }
    }
}

/// How the first batch of configurations is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialDesign {
    LatinHypercube,
    Random,
    /// Only the space default.
    Default,
}

impl Default for InitialDesign {
    fn default() -> Self {
        Self::LatinHypercube
    }
}

/// Top-level configuration for a search run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub id: ScenarioId,
    pub name: String,
    pub direction: ObjectiveDirection,

    /// Exact number of objective evaluations.
    pub runcount_limit: usize,

    /// Never re-evaluate a configuration already in the history.
    pub deterministic: bool,

    /// Fail the search if the very first evaluation crashes.
    pub abort_on_first_run_crash: bool,

    pub initial_design: InitialDesign,

    /// Size of the initial design; derived from the space when unset.
    pub initial_design_size: Option<usize>,

    /// Probability of a uniform sample after the initial design.
    pub exploration_weight: f64,

    pub created_at: DateTime<Utc>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new("search")
    }
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            direction: ObjectiveDirection::Minimize,
            runcount_limit: 100,
            deterministic: true,
            abort_on_first_run_crash: false,
            initial_design: InitialDesign::LatinHypercube,
            initial_design_size: None,
            exploration_weight: 0.3,
            created_at: Utc::now(),
        }
    }

    pub fn with_direction(mut self, direction: ObjectiveDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_runcount_limit(mut self, n: usize) -> Self {
        self.runcount_limit = n;
        self
    }

    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub fn with_abort_on_first_run_crash(mut self, abort: bool) -> Self {
        self.abort_on_first_run_crash = abort;
        self
    }

    pub fn with_initial_design(mut self, design: InitialDesign, size: Option<usize>) -> Self {
        self.initial_design = design;
        self.initial_design_size = size;
        self
    }

    pub fn with_exploration_weight(mut self, weight: f64) -> Self {
        self.exploration_weight = weight;
        self
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        if self.runcount_limit == 0 {
            return Err(SearchError::InvalidScenario {
                message: "runcount_limit must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.exploration_weight) {
            return Err(SearchError::InvalidScenario {
                message: format!(
                    "exploration_weight {} outside [0, 1]",
                    self.exploration_weight
                ),
            });
        }
        if self.initial_design_size == Some(0) {
            return Err(SearchError::InvalidScenario {
                message: "initial_design_size must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Number of initial-design evaluations for a space with `dims`
    /// parameters, never more than the run budget.
    pub fn effective_initial_design_size(&self, dims: usize) -> usize {
        let size = match (self.initial_design, self.initial_design_size) {
            (InitialDesign::Default, _) => 1,
            (_, Some(n)) => n,
            (_, None) => (dims * 10).min(self.runcount_limit / 4).max(1),
        };
        size.min(self.runcount_limit)
    }
}

/// Lifecycle state for a search run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Aggregate status of a search run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchStatus {
    pub id: ScenarioId,
    pub direction: ObjectiveDirection,
    pub state: SearchState,
    pub trials_completed: usize,
    pub trials_failed: usize,
    pub best_trial: Option<usize>,
    #[serde(with = "ct_types::float_serde::option")]
    pub best_cost: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SearchStatus {
    pub fn new(scenario: &Scenario) -> Self {
        Self {
            id: scenario.id,
            direction: scenario.direction,
            state: SearchState::Pending,
            trials_completed: 0,
            trials_failed: 0,
            best_trial: None,
            best_cost: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = SearchState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.state = SearchState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = SearchState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Count a finished run and update the best if it improves on it.
    pub fn record<I>(&mut self, record: &RunRecord<I>) {
        if !record.is_success() {
            self.trials_failed += 1;
            return;
        }
        self.trials_completed += 1;
        let loss = self.direction.loss(record.cost);
        let improved = match self.best_cost {
            None => !loss.is_nan(),
            Some(best) => loss < self.direction.loss(best),
        };
        if improved {
            self.best_trial = Some(record.trial_number);
            self.best_cost = Some(record.cost);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::RunStatus;
    use ct_types::Configuration;

    #[test]
    fn scenario_builder() {
        let scenario = Scenario::new("pipeline")
            .with_runcount_limit(40)
            .with_deterministic(false)
            .with_abort_on_first_run_crash(true)
            .with_initial_design(InitialDesign::Random, Some(5));

        assert_eq!(scenario.runcount_limit, 40);
        assert!(!scenario.deterministic);
        assert!(scenario.abort_on_first_run_crash);
        assert_eq!(scenario.effective_initial_design_size(3), 5);
        scenario.validate().unwrap();
    }

    #[test]
    fn initial_design_size_is_bounded_by_budget() {
        let scenario = Scenario::new("s").with_runcount_limit(8);
        assert_eq!(scenario.effective_initial_design_size(4), 2);

        let tiny = Scenario::new("s").with_runcount_limit(2);
        assert_eq!(tiny.effective_initial_design_size(4), 1);

        let oversized = Scenario::new("s")
            .with_runcount_limit(3)
            .with_initial_design(InitialDesign::LatinHypercube, Some(10));
        assert_eq!(oversized.effective_initial_design_size(1), 3);
    }

    #[test]
    fn invalid_scenarios_are_rejected() {
        assert!(Scenario::new("s").with_runcount_limit(0).validate().is_err());
        assert!(Scenario::new("s").with_exploration_weight(1.5).validate().is_err());
        assert!(Scenario::new("s")
            .with_initial_design(InitialDesign::Random, Some(0))
            .validate()
            .is_err());
    }

    #[test]
    fn status_lifecycle() {
        let scenario = Scenario::new("s");
        let mut status = SearchStatus::new(&scenario);
        assert_eq!(status.state, SearchState::Pending);

        status.mark_running();
        assert!(status.started_at.is_some());

        let now = Utc::now();
        let mut record = RunRecord::<()> {
            id: Uuid::new_v4(),
            trial_number: 0,
            configuration: Configuration::new(),
            cost: 2.0,
            status: RunStatus::Success,
            additional_info: None,
            error: None,
            started_at: now,
            finished_at: now,
        };
        status.record(&record);
        record.trial_number = 1;
        record.cost = 1.0;
        status.record(&record);
        record.trial_number = 2;
        record.status = RunStatus::Crashed;
        record.cost = f64::INFINITY;
        status.record(&record);

        assert_eq!(status.trials_completed, 2);
        assert_eq!(status.trials_failed, 1);
        assert_eq!(status.best_trial, Some(1));

        status.mark_failed("boom".to_string());
        assert_eq!(status.state, SearchState::Failed);
        assert_eq!(status.error.as_deref(), Some("boom"));
    }

    #[test]
    fn status_json_keeps_infinite_best_cost() {
        let mut status = SearchStatus::new(&Scenario::new("s"));
        status.best_cost = Some(f64::INFINITY);
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"best_cost\":\"inf\""), "{json}");
        let back: SearchStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.best_cost, Some(f64::INFINITY));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let scenario: Scenario =
            serde_json::from_str(r#"{"runcount_limit": 25, "initial_design": "random"}"#).unwrap();
        assert_eq!(scenario.runcount_limit, 25);
        assert_eq!(scenario.initial_design, InitialDesign::Random);
        assert_eq!(scenario.direction, ObjectiveDirection::Minimize);
        assert!(scenario.deterministic);
    }

    #[test]
    fn maximize_flips_loss() {
        assert_eq!(ObjectiveDirection::Maximize.loss(3.0), -3.0);
        assert_eq!(ObjectiveDirection::Minimize.worst(), f64::INFINITY);
    }
}
