//! Sequential model-based optimization loop.
//!
//! The loop evaluates an initial design, then alternates between asking the
//! adaptive strategy for a configuration and reporting its loss back. It
//! evaluates exactly `runcount_limit` configurations and owns the resulting
//! [`RunHistory`].

use std::collections::VecDeque;

use chrono::Utc;
use ct_types::{Configuration, ConfigurationSpace, CtError, SearchError, WorkerError};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::history::{RunHistory, RunRecord, RunStatus};
use crate::scenario::{InitialDesign, Scenario, SearchStatus};
use crate::search::{BayesianSearch, LatinHypercube, RandomSearch, SearchStrategy};

/// Attempts at drawing a configuration not yet in the history.
const MAX_RESAMPLES: usize = 20;

/// What an objective returns for one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialOutcome<I> {
    pub cost: f64,
    /// Free-form payload stored alongside the run.
    pub info: Option<I>,
}

impl<I> TrialOutcome<I> {
    pub fn new(cost: f64, info: Option<I>) -> Self {
        Self { cost, info }
    }
}

/// A black-box function of a configuration. An `Err` is recorded as a
/// crashed run and the search continues.
pub trait Objective<I> {
    fn evaluate(&self, cfg: &Configuration) -> Result<TrialOutcome<I>, CtError>;
}

impl<I, F> Objective<I> for F
where
    F: Fn(&Configuration) -> Result<TrialOutcome<I>, CtError>,
{
    fn evaluate(&self, cfg: &Configuration) -> Result<TrialOutcome<I>, CtError> {
        self(cfg)
    }
}

pub struct Smbo<I> {
    space: ConfigurationSpace,
    scenario: Scenario,
    seed: u64,
    rng: ChaCha8Rng,
    history: RunHistory<I>,
    status: SearchStatus,
}

impl<I> Smbo<I> {
    pub fn new(space: ConfigurationSpace, scenario: Scenario, seed: u64) -> Result<Self, CtError> {
        space.validate()?;
        scenario.validate()?;
        let status = SearchStatus::new(&scenario);
        Ok(Self {
            space,
            scenario,
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            history: RunHistory::new(),
            status,
        })
    }

    pub fn space(&self) -> &ConfigurationSpace {
        &self.space
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn status(&self) -> &SearchStatus {
        &self.status
    }

    pub fn run_history(&self) -> &RunHistory<I> {
        &self.history
    }

    pub fn into_run_history(self) -> RunHistory<I> {
        self.history
    }

    /// Best successful configuration so far, earliest on ties.
    pub fn incumbent(&self) -> Option<&RunRecord<I>> {
        let direction = self.scenario.direction;
        self.history.best_by(|r| direction.loss(r.cost))
    }

    /// Run the search to its budget and return the incumbent.
    pub fn optimize(&mut self, objective: &dyn Objective<I>) -> Result<Configuration, CtError> {
        self.status.mark_running();
        let budget = self.scenario.runcount_limit;
        let n_init = self.scenario.effective_initial_design_size(self.space.len());
        info!(
            "Starting search '{}': {} runs, {} initial ({:?}), seed {}",
            self.scenario.name, budget, n_init, self.scenario.initial_design, self.seed
        );

        let mut queue: VecDeque<Configuration> = match self.scenario.initial_design {
            InitialDesign::LatinHypercube => {
                LatinHypercube::new(self.space.clone()).suggest(n_init, &mut self.rng)
            }
            InitialDesign::Random => {
                RandomSearch::new(self.space.clone()).suggest(n_init, &mut self.rng)
            }
            InitialDesign::Default => vec![self.space.default_configuration()],
        }
        .into();

        let mut strategy =
            BayesianSearch::new(self.space.clone(), self.scenario.exploration_weight);

        for trial in 0..budget {
            let cfg = match queue.pop_front() {
                Some(cfg) => cfg,
                None => self.next_from(&mut strategy),
            };
            let cfg = if self.scenario.deterministic && self.history.contains(&cfg) {
                self.next_from(&mut strategy)
            } else {
                cfg
            };

            let record = self.run_one(trial, cfg, objective);
            if trial == 0 && !record.is_success() && self.scenario.abort_on_first_run_crash {
                let message = record.error.clone().unwrap_or_default();
                self.status.record(&record);
                self.history.push(record);
                self.status.mark_failed(message.clone());
                return Err(SearchError::FirstRunCrashed { message }.into());
            }

            strategy.report(&record.configuration, self.scenario.direction.loss(record.cost));
            self.status.record(&record);
            self.history.push(record);
        }

        match self.incumbent() {
            Some(best) => {
                info!(
                    "Search '{}' finished: incumbent trial {} cost {:.6} ({} failed runs)",
                    self.scenario.name,
                    best.trial_number,
                    best.cost,
                    self.history.num_failed()
                );
                let cfg = best.configuration.clone();
                self.status.mark_completed();
                Ok(cfg)
            }
            None => {
                let err = SearchError::Exhausted {
                    runs: self.history.len(),
                };
                self.status.mark_failed(err.to_string());
                Err(err.into())
            }
        }
    }

    /// Draw from the strategy, avoiding configurations already evaluated
    /// when the scenario is deterministic.
    fn next_from(&mut self, strategy: &mut dyn SearchStrategy) -> Configuration {
        let mut candidate = self.space.default_configuration();
        for attempt in 0..MAX_RESAMPLES {
            if let Some(cfg) = strategy.suggest(1, &mut self.rng).pop() {
                candidate = cfg;
            }
            if !self.scenario.deterministic || !self.history.contains(&candidate) {
                return candidate;
            }
            debug!("Resampling duplicate configuration (attempt {})", attempt + 1);
        }
        // The strategy keeps proposing known points; fall back to uniform draws.
        for _ in 0..MAX_RESAMPLES {
            candidate = self.space.sample(&mut self.rng);
            if !self.history.contains(&candidate) {
                break;
            }
        }
        candidate
    }

    fn run_one(
        &self,
        trial: usize,
        cfg: Configuration,
        objective: &dyn Objective<I>,
    ) -> RunRecord<I> {
        let started_at = Utc::now();
        let outcome = objective.evaluate(&cfg);
        let finished_at = Utc::now();

        let (cost, status, additional_info, error) = match outcome {
            Ok(TrialOutcome { cost, info }) if cost.is_nan() => {
                warn!("Trial {} returned NaN cost; recording worst cost", trial);
                (self.scenario.direction.worst(), RunStatus::Success, info, None)
            }
            Ok(TrialOutcome { cost, info }) => (cost, RunStatus::Success, info, None),
            Err(e) => {
                let status = match &e {
                    CtError::Worker(WorkerError::Timeout { .. }) => RunStatus::Timeout,
                    _ => RunStatus::Crashed,
                };
                warn!("Trial {} {:?}: {}", trial, status, e);
                (
                    self.scenario.direction.worst(),
                    status,
                    None,
                    Some(e.to_string()),
                )
            }
        };
        debug!("Trial {} {} -> {}", trial, cfg, cost);

        RunRecord {
            id: Uuid::new_v4(),
            trial_number: trial,
            configuration: cfg,
            cost,
            status,
            additional_info,
            error,
            started_at,
            finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::ObjectiveDirection;

    fn space() -> ConfigurationSpace {
        ConfigurationSpace::new().add_float("x", -5.0, 5.0)
    }

    fn quadratic(cfg: &Configuration) -> Result<TrialOutcome<f64>, CtError> {
        let x = cfg.get_f64("x").unwrap_or(f64::NAN);
        Ok(TrialOutcome::new(x * x, Some(x)))
    }

    #[test]
    fn runs_exactly_the_budget() {
        let scenario = Scenario::new("quadratic").with_runcount_limit(30);
        let mut smbo = Smbo::<f64>::new(space(), scenario, 7).unwrap();
        let best = smbo.optimize(&quadratic).unwrap();

        assert_eq!(smbo.run_history().len(), 30);
        let x = best.get_f64("x").unwrap();
        let min_seen = smbo
            .run_history()
            .records()
            .iter()
            .map(|r| r.cost)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(x * x, min_seen);
        assert!(x.abs() < 1.0);
        assert_eq!(smbo.status().trials_completed, 30);
    }

    #[test]
    fn same_seed_same_trajectory_of_configurations() {
        let run = |seed| {
            let scenario = Scenario::new("q").with_runcount_limit(12);
            let mut smbo = Smbo::<f64>::new(space(), scenario, seed).unwrap();
            smbo.optimize(&quadratic).unwrap();
            smbo.into_run_history()
                .into_records()
                .into_iter()
                .map(|r| r.configuration)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(11), run(11));
        assert_ne!(run(11), run(12));
    }

    #[test]
    fn crashes_are_recorded_and_skipped() {
        let flaky = |cfg: &Configuration| -> Result<TrialOutcome<f64>, CtError> {
            let x = cfg.get_f64("x").unwrap_or(0.0);
            if x > 0.0 {
                Err(WorkerError::Crashed {
                    message: "segfault".to_string(),
                }
                .into())
            } else {
                Ok(TrialOutcome::new(x * x, None))
            }
        };
        let scenario = Scenario::new("flaky").with_runcount_limit(20);
        let mut smbo = Smbo::<f64>::new(space(), scenario, 3).unwrap();
        let best = smbo.optimize(&flaky).unwrap();

        assert_eq!(smbo.run_history().len(), 20);
        assert!(best.get_f64("x").unwrap() <= 0.0);
        for record in smbo.run_history().records() {
            if record.status == RunStatus::Crashed {
                assert_eq!(record.cost, f64::INFINITY);
                assert!(record.error.as_deref().unwrap().contains("segfault"));
            }
        }
    }

    #[test]
    fn timeouts_are_classified() {
        let slow = |_: &Configuration| -> Result<TrialOutcome<()>, CtError> {
            Err(WorkerError::Timeout { seconds: 1.0 }.into())
        };
        let scenario = Scenario::new("slow").with_runcount_limit(3);
        let mut smbo = Smbo::<()>::new(space(), scenario, 1).unwrap();
        let err = smbo.optimize(&slow).unwrap_err();

        assert!(matches!(err, CtError::Search(SearchError::Exhausted { runs: 3 })));
        assert!(smbo
            .run_history()
            .records()
            .iter()
            .all(|r| r.status == RunStatus::Timeout));
    }

    #[test]
    fn first_crash_aborts_when_requested() {
        let broken = |_: &Configuration| -> Result<TrialOutcome<()>, CtError> {
            Err(CtError::Internal("broken".to_string()))
        };
        let scenario = Scenario::new("broken")
            .with_runcount_limit(5)
            .with_abort_on_first_run_crash(true);
        let mut smbo = Smbo::<()>::new(space(), scenario, 1).unwrap();
        let err = smbo.optimize(&broken).unwrap_err();

        assert!(matches!(err, CtError::Search(SearchError::FirstRunCrashed { .. })));
        assert_eq!(smbo.run_history().len(), 1);
    }

    #[test]
    fn deterministic_search_avoids_duplicates_when_possible() {
        let small = ConfigurationSpace::new().add_int("k", 0, 9);
        let objective = |cfg: &Configuration| -> Result<TrialOutcome<()>, CtError> {
            Ok(TrialOutcome::new(cfg.get_i64("k").unwrap_or(0) as f64, None))
        };
        let scenario = Scenario::new("ints").with_runcount_limit(6);
        let mut smbo = Smbo::<()>::new(small, scenario, 5).unwrap();
        smbo.optimize(&objective).unwrap();

        let mut seen: Vec<i64> = smbo
            .run_history()
            .records()
            .iter()
            .map(|r| r.configuration.get_i64("k").unwrap())
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn maximize_picks_largest() {
        let scenario = Scenario::new("max")
            .with_runcount_limit(15)
            .with_direction(ObjectiveDirection::Maximize);
        let mut smbo = Smbo::<f64>::new(space(), scenario, 9).unwrap();
        smbo.optimize(&quadratic).unwrap();

        let best = smbo.incumbent().unwrap().cost;
        assert!(smbo.run_history().records().iter().all(|r| r.cost <= best));
    }

    #[test]
    fn malformed_space_is_rejected() {
        let err = Smbo::<()>::new(ConfigurationSpace::new(), Scenario::default(), 0);
        assert!(matches!(err, Err(CtError::Space(_))));
    }
}
