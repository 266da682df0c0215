//! Controllers, tasks and the tunable pipeline interface.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, SimulationError};
use crate::model::Model;
use crate::space::{Configuration, ConfigurationSpace};
use crate::trajectory::{System, Trajectory};

/// A feedback controller producing one control per observation.
pub trait Controller: Send {
    /// Clear any internal state (warm starts, integrators, histories).
    fn reset(&mut self);

    fn run(&mut self, obs: &[f64]) -> Result<Vec<f64>, SimulationError>;

    /// A fresh, reset copy with the same synthesized parameters.
    fn fork(&self) -> Box<dyn Controller>;
}

/// Scores a finished trajectory; lower is better.
pub trait CostFunction: Send + Sync {
    fn evaluate(&self, traj: &Trajectory) -> f64;
}

impl<F> CostFunction for F
where
    F: Fn(&Trajectory) -> f64 + Send + Sync,
{
    fn evaluate(&self, traj: &Trajectory) -> f64 {
        self(traj)
    }
}

/// Ground-truth dynamics, used only for diagnostics.
pub trait Dynamics: Send + Sync {
    fn step(&self, obs: &[f64], ctrl: &[f64]) -> Result<Vec<f64>, SimulationError>;
}

impl<F> Dynamics for F
where
    F: Fn(&[f64], &[f64]) -> Result<Vec<f64>, SimulationError> + Send + Sync,
{
    fn step(&self, obs: &[f64], ctrl: &[f64]) -> Result<Vec<f64>, SimulationError> {
        self(obs, ctrl)
    }
}

/// Termination predicate evaluated on the trajectory simulated so far.
pub type TermCond = Arc<dyn Fn(&Trajectory) -> bool + Send + Sync>;

/// Inclusive range for one control.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CtrlBound {
    #[serde(with = "crate::float_serde")]
    pub low: f64,
    #[serde(with = "crate::float_serde")]
    pub high: f64,
}

/// The parts of a [`Task`] that can be written out. The cost function and
/// termination predicate are code and have to be supplied again on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    pub init_obs: Vec<f64>,
    pub num_steps: Option<usize>,
    pub ctrl_bounds: Option<Vec<CtrlBound>>,
}

/// Control problem the pipeline is tuned for.
#[derive(Clone)]
pub struct Task {
    system: System,
    init_obs: Vec<f64>,
    num_steps: Option<usize>,
    term_cond: Option<TermCond>,
    ctrl_bounds: Option<Vec<(f64, f64)>>,
    cost: Arc<dyn CostFunction>,
}

impl Task {
    pub fn new(system: System, init_obs: Vec<f64>, cost: Arc<dyn CostFunction>) -> Self {
        Self {
            system,
            init_obs,
            num_steps: None,
            term_cond: None,
            ctrl_bounds: None,
            cost,
        }
    }

    pub fn with_num_steps(mut self, steps: usize) -> Self {
        self.num_steps = Some(steps);
        self
    }

    pub fn with_term_cond(mut self, term_cond: TermCond) -> Self {
        self.term_cond = Some(term_cond);
        self
    }

    /// Per-control (lower, upper) bounds.
    pub fn with_ctrl_bounds(mut self, bounds: Vec<(f64, f64)>) -> Self {
        self.ctrl_bounds = Some(bounds);
        self
    }

    /// Rebuild a task from saved settings.
    pub fn from_settings(
        system: System,
        settings: TaskSettings,
        cost: Arc<dyn CostFunction>,
    ) -> Self {
        Self {
            system,
            init_obs: settings.init_obs,
            num_steps: settings.num_steps,
            term_cond: None,
            ctrl_bounds: settings
                .ctrl_bounds
                .map(|bounds| bounds.into_iter().map(|b| (b.low, b.high)).collect()),
            cost,
        }
    }

    pub fn settings(&self) -> TaskSettings {
        TaskSettings {
            init_obs: self.init_obs.clone(),
            num_steps: self.num_steps,
            ctrl_bounds: self.ctrl_bounds.as_ref().map(|bounds| {
                bounds
                    .iter()
                    .map(|&(low, high)| CtrlBound { low, high })
                    .collect()
            }),
        }
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn init_obs(&self) -> &[f64] {
        &self.init_obs
    }

    pub fn has_num_steps(&self) -> bool {
        self.num_steps.is_some()
    }

    pub fn num_steps(&self) -> Option<usize> {
        self.num_steps
    }

    pub fn term_cond(&self) -> Option<&TermCond> {
        self.term_cond.as_ref()
    }

    pub fn ctrl_bounds(&self) -> Option<&[(f64, f64)]> {
        self.ctrl_bounds.as_deref()
    }

    pub fn cost(&self) -> &Arc<dyn CostFunction> {
        &self.cost
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("system", &self.system)
            .field("init_obs", &self.init_obs)
            .field("num_steps", &self.num_steps)
            .field("has_term_cond", &self.term_cond.is_some())
            .field("ctrl_bounds", &self.ctrl_bounds)
            .finish()
    }
}

/// Everything a pipeline produces for one configuration.
pub struct PipelineOutput {
    pub controller: Box<dyn Controller>,
    pub cost: Arc<dyn CostFunction>,
    pub model: Arc<dyn Model>,
}

/// A configurable SysID+MPC pipeline.
pub trait Pipeline: Send + Sync {
    fn system(&self) -> &System;

    fn configuration_space(&self) -> ConfigurationSpace;

    /// Train a model on `trajs` and synthesize a controller for `task`.
    /// A supplied `model` is reused as-is and not retrained.
    fn build(
        &self,
        cfg: &Configuration,
        task: &Task,
        trajs: &[Trajectory],
        model: Option<Arc<dyn Model>>,
    ) -> Result<PipelineOutput, PipelineError>;

    /// Known-good configuration evaluated once before a search starts.
    fn sanity_configuration(&self) -> Configuration {
        self.configuration_space().default_configuration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_cost(_: &Trajectory) -> f64 {
        0.0
    }

    #[test]
    fn settings_survive_json_with_open_bounds() {
        let system = System::new(["x", "v"], ["f"]);
        let task = Task::new(system.clone(), vec![1.0, 0.0], Arc::new(zero_cost))
            .with_num_steps(50)
            .with_ctrl_bounds(vec![(f64::NEG_INFINITY, 3.0)]);

        let json = serde_json::to_string(&task.settings()).unwrap();
        assert!(json.contains("\"-inf\""), "{json}");
        let settings: TaskSettings = serde_json::from_str(&json).unwrap();
        let back = Task::from_settings(system, settings, Arc::new(zero_cost));

        assert_eq!(back.init_obs(), task.init_obs());
        assert_eq!(back.num_steps(), Some(50));
        assert_eq!(back.ctrl_bounds(), Some(&[(f64::NEG_INFINITY, 3.0)][..]));
        assert!(back.term_cond().is_none());
    }
}
