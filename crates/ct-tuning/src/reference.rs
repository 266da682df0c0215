//! Scalar reference problem: a first-order linear plant `x' = a x + b u`, a
//! least-squares surrogate family for it and a proportional-gain pipeline.
//!
//! The `ct-worker` binary serves this problem, so a tuner running with
//! [`crate::Isolation::Process`] can be smoke-tested end to end.

use std::sync::Arc;

use ct_types::{
    Configuration, ConfigurationSpace, Controller, CostFunction, Dynamics, Model, ModelError,
    ModelFactory, ModelSnapshot, ParameterDef, Pipeline, PipelineError, PipelineOutput,
    SimulationError, SpaceError, System, Task, Trajectory,
};
use serde::{Deserialize, Serialize};

/// Label of the least-squares surrogate family.
pub const LSQ_LABEL: &str = "LSQ";

/// One observation `x`, one control `u`.
pub fn system() -> System {
    System::new(["x"], ["u"])
}

/// Regulate `x` from 1 to 0 over 20 steps with `|u| <= 2`.
pub fn task() -> Task {
    Task::new(system(), vec![1.0], Arc::new(QuadraticCost::default()))
        .with_num_steps(20)
        .with_ctrl_bounds(vec![(-2.0, 2.0)])
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearPlant {
    pub a: f64,
    pub b: f64,
}

impl LinearPlant {
    pub const REFERENCE: Self = Self { a: 0.9, b: 0.5 };
}

impl Dynamics for LinearPlant {
    fn step(&self, obs: &[f64], ctrl: &[f64]) -> Result<Vec<f64>, SimulationError> {
        Ok(vec![self.a * obs[0] + self.b * ctrl[0]])
    }
}

/// Sum of `x^2 + ctrl_weight * u^2` over the trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadraticCost {
    pub ctrl_weight: f64,
}

impl Default for QuadraticCost {
    fn default() -> Self {
        Self { ctrl_weight: 0.1 }
    }
}

impl CostFunction for QuadraticCost {
    fn evaluate(&self, traj: &Trajectory) -> f64 {
        traj.obs()
            .iter()
            .zip(traj.ctrls())
            .map(|(x, u)| x[0] * x[0] + self.ctrl_weight * u[0] * u[0])
            .sum()
    }
}

// ---- Least-squares surrogate ----

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Coefficients {
    a: f64,
    b: f64,
}

/// Fits `x' = a x + b u` by ridge least squares. Data without excitation
/// leaves the model trained but singular; it then fails every prediction.
pub struct LeastSquaresModel {
    label: String,
    cfg: Configuration,
    system: System,
    coef: Option<Coefficients>,
    singular: bool,
}

impl LeastSquaresModel {
    pub fn coefficients(&self) -> Option<(f64, f64)> {
        self.coef.map(|c| (c.a, c.b))
    }

    pub fn is_singular(&self) -> bool {
        self.singular
    }
}

impl Model for LeastSquaresModel {
    fn name(&self) -> &str {
        &self.label
    }

    fn configuration(&self) -> &Configuration {
        &self.cfg
    }

    fn system(&self) -> &System {
        &self.system
    }

    fn is_trained(&self) -> bool {
        self.coef.is_some() || self.singular
    }

    fn train(&mut self, trajs: &[Trajectory]) -> Result<(), ModelError> {
        let ridge = self.cfg.get_f64("ridge").unwrap_or(0.0);
        let (mut sxx, mut sxu, mut suu, mut sxy, mut suy) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for traj in trajs {
            let obs = traj.obs();
            let ctrls = traj.ctrls();
            for t in 0..traj.len().saturating_sub(1) {
                let (x, u, y) = (obs[t][0], ctrls[t][0], obs[t + 1][0]);
                sxx += x * x;
                sxu += x * u;
                suu += u * u;
                sxy += x * y;
                suy += u * y;
            }
        }
        sxx += ridge;
        suu += ridge;

        let det = sxx * suu - sxu * sxu;
        if det.abs() < 1e-12 {
            self.coef = None;
            self.singular = true;
        } else {
            self.coef = Some(Coefficients {
                a: (sxy * suu - suy * sxu) / det,
                b: (suy * sxx - sxy * sxu) / det,
            });
            self.singular = false;
        }
        Ok(())
    }

    fn clone_untrained(&self) -> Box<dyn Model> {
        Box::new(Self {
            label: self.label.clone(),
            cfg: self.cfg.clone(),
            system: self.system.clone(),
            coef: None,
            singular: false,
        })
    }

    fn pred(&self, obs: &[f64], ctrl: &[f64]) -> Result<Vec<f64>, SimulationError> {
        match self.coef {
            Some(c) => Ok(vec![c.a * obs[0] + c.b * ctrl[0]]),
            None => Err(SimulationError::LinAlg {
                message: "singular normal equations".to_string(),
            }),
        }
    }

    fn snapshot(&self) -> Result<ModelSnapshot, ModelError> {
        Ok(ModelSnapshot {
            name: self.label.clone(),
            configuration: self.cfg.clone(),
            state: serde_json::to_value(self.coef).map_err(|e| ModelError::Training {
                message: e.to_string(),
            })?,
        })
    }
}

pub struct LeastSquaresFactory {
    label: String,
    system: System,
}

impl Default for LeastSquaresFactory {
    fn default() -> Self {
        Self::named(LSQ_LABEL)
    }
}

impl LeastSquaresFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The same family under another label.
    pub fn named(label: &str) -> Self {
        Self {
            label: label.to_string(),
            system: system(),
        }
    }
}

impl ModelFactory for LeastSquaresFactory {
    fn name(&self) -> &str {
        &self.label
    }

    fn system(&self) -> &System {
        &self.system
    }

    fn configuration_space(&self) -> ConfigurationSpace {
        ConfigurationSpace::new().add(ParameterDef::float("ridge", 0.0, 1.0).with_default(0.0))
    }

    fn build(&self, cfg: &Configuration, trajs: &[Trajectory]) -> Result<Box<dyn Model>, ModelError> {
        self.configuration_space().check_configuration(cfg)?;
        let mut model = LeastSquaresModel {
            label: self.label.clone(),
            cfg: cfg.clone(),
            system: self.system.clone(),
            coef: None,
            singular: false,
        };
        model.train(trajs)?;
        Ok(Box::new(model))
    }

    fn restore(&self, snapshot: &ModelSnapshot) -> Result<Box<dyn Model>, ModelError> {
        if snapshot.name != self.label {
            return Err(ModelError::SnapshotMismatch {
                expected: self.label.clone(),
                actual: snapshot.name.clone(),
            });
        }
        let coef: Option<Coefficients> =
            serde_json::from_value(snapshot.state.clone()).map_err(|e| ModelError::Training {
                message: e.to_string(),
            })?;
        Ok(Box::new(LeastSquaresModel {
            label: self.label.clone(),
            cfg: snapshot.configuration.clone(),
            system: self.system.clone(),
            coef,
            singular: coef.is_none(),
        }))
    }
}

// ---- Proportional-gain pipeline ----

/// u = -gain * x
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainController {
    pub gain: f64,
}

impl Controller for GainController {
    fn reset(&mut self) {}

    fn run(&mut self, obs: &[f64]) -> Result<Vec<f64>, SimulationError> {
        Ok(vec![-self.gain * obs[0]])
    }

    fn fork(&self) -> Box<dyn Controller> {
        Box::new(*self)
    }
}

/// Tunes `gain` in `[0, 2]`. The sysid model is fitted with the default
/// least-squares configuration and reported, not used by the controller.
pub struct GainPipeline {
    system: System,
    factory: LeastSquaresFactory,
    max_gain: Option<f64>,
}

impl Default for GainPipeline {
    fn default() -> Self {
        Self {
            system: system(),
            factory: LeastSquaresFactory::new(),
            max_gain: None,
        }
    }
}

impl GainPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gains above `gain` are rejected as incompatible.
    pub fn with_max_gain(mut self, gain: f64) -> Self {
        self.max_gain = Some(gain);
        self
    }
}

impl Pipeline for GainPipeline {
    fn system(&self) -> &System {
        &self.system
    }

    fn configuration_space(&self) -> ConfigurationSpace {
        ConfigurationSpace::new().add(ParameterDef::float("gain", 0.0, 2.0).with_default(0.5))
    }

    fn build(
        &self,
        cfg: &Configuration,
        task: &Task,
        trajs: &[Trajectory],
        model: Option<Arc<dyn Model>>,
    ) -> Result<PipelineOutput, PipelineError> {
        let gain = cfg.get_f64("gain").ok_or(SpaceError::MissingParameter {
            name: "gain".to_string(),
        })?;
        if self.max_gain.is_some_and(|limit| gain > limit) {
            return Err(PipelineError::Incompatible {
                message: format!("gain {gain} is not supported"),
            });
        }

        let model = match model {
            Some(model) => model,
            None => {
                let cfg = self.factory.configuration_space().default_configuration();
                let model = self
                    .factory
                    .build(&cfg, trajs)
                    .map_err(|e| PipelineError::Sysid {
                        message: e.to_string(),
                    })?;
                Arc::from(model)
            }
        };
        Ok(PipelineOutput {
            controller: Box::new(GainController { gain }),
            cost: Arc::clone(task.cost()),
            model,
        })
    }
}
