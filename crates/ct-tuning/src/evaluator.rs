//! Per-configuration evaluation of a pipeline against the surrogate.

use std::sync::Arc;

use ct_types::{
    simulate, Configuration, Controller, Dynamics, Model, Pipeline, PipelineError, Plant,
    SimulationError, Task, Trajectory, TrajectoryData,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a configuration produced no usable surrogate cost.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    /// Linear-algebra failure or a diverging state during simulation.
    #[error("numerical failure: {message}")]
    Numerical { message: String },

    /// The controller cannot be paired with the chosen model.
    #[error("incompatible pipeline: {message}")]
    Incompatible { message: String },

    /// Any other pipeline or model failure; reported as a crashed run.
    #[error("evaluation fault: {message}")]
    Fault { message: String },
}

/// Everything recorded about one evaluated configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalInfo {
    #[serde(with = "ct_types::float_serde")]
    pub surr_cost: f64,
    pub surr_traj: Option<TrajectoryData>,
    pub surr_rejection: Option<RejectionReason>,
    /// Diagnostics only; `None` when no true dynamics were supplied.
    #[serde(with = "ct_types::float_serde::option")]
    pub truedyn_cost: Option<f64>,
    pub truedyn_traj: Option<TrajectoryData>,
}

/// Serialized outcome of an evaluation, as it crosses a worker boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResponse {
    #[serde(with = "ct_types::float_serde")]
    pub cost: f64,
    pub info: Option<EvalInfo>,
    pub rejection: Option<RejectionReason>,
}

impl EvalResponse {
    pub fn from_outcome(outcome: Result<EvalInfo, RejectionReason>) -> Self {
        match outcome {
            Ok(info) => Self {
                cost: info.surr_cost,
                info: Some(info),
                rejection: None,
            },
            Err(reason) => Self {
                cost: f64::INFINITY,
                info: None,
                rejection: Some(reason),
            },
        }
    }
}

/// Scores pipeline configurations by closed-loop simulation against a fixed
/// surrogate model.
pub struct ConfigEvaluator {
    pipeline: Arc<dyn Pipeline>,
    task: Task,
    surrogate: Arc<dyn Model>,
    sysid_trajs: Vec<Trajectory>,
    truedyn: Option<Arc<dyn Dynamics>>,
}

impl ConfigEvaluator {
    pub fn new(
        pipeline: Arc<dyn Pipeline>,
        task: Task,
        surrogate: Arc<dyn Model>,
        sysid_trajs: Vec<Trajectory>,
    ) -> Self {
        Self {
            pipeline,
            task,
            surrogate,
            sysid_trajs,
            truedyn: None,
        }
    }

    /// Also simulate every configuration against ground-truth dynamics.
    pub fn with_truedyn(mut self, truedyn: Arc<dyn Dynamics>) -> Self {
        self.truedyn = Some(truedyn);
        self
    }

    pub fn pipeline(&self) -> &Arc<dyn Pipeline> {
        &self.pipeline
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn surrogate(&self) -> &Arc<dyn Model> {
        &self.surrogate
    }

    pub fn sysid_trajs(&self) -> &[Trajectory] {
        &self.sysid_trajs
    }

    pub fn truedyn(&self) -> Option<&Arc<dyn Dynamics>> {
        self.truedyn.as_ref()
    }

    pub fn evaluate(&self, cfg: &Configuration) -> Result<EvalInfo, RejectionReason> {
        let output = self
            .pipeline
            .build(cfg, &self.task, &self.sysid_trajs, None)
            .map_err(|e| rejection(cfg, e))?;
        let mut controller = output.controller;

        debug!("Simulating surrogate trajectory for {}", cfg);
        controller.reset();
        let (surr_cost, surr_traj, surr_rejection) =
            match self.simulate(controller.as_mut(), Plant::Model(self.surrogate.as_ref())) {
                Ok(traj) => {
                    let cost = self.task.cost().evaluate(&traj);
                    info!(
                        "Surrogate cost {:.6}, final state {:?}",
                        cost,
                        traj.final_obs().unwrap_or_default()
                    );
                    (cost, Some(TrajectoryData::from(&traj)), None)
                }
                Err(e) if e.is_numerical() => {
                    warn!("Surrogate simulation rejected {}: {}", cfg, e);
                    let reason = RejectionReason::Numerical {
                        message: e.to_string(),
                    };
                    (f64::INFINITY, None, Some(reason))
                }
                Err(e) => return Err(fault(e)),
            };

        let (truedyn_cost, truedyn_traj) = match &self.truedyn {
            None => (None, None),
            Some(dynamics) => {
                debug!("Simulating true dynamics trajectory for {}", cfg);
                let rebuilt = self
                    .pipeline
                    .build(cfg, &self.task, &self.sysid_trajs, Some(Arc::clone(&output.model)))
                    .map_err(|e| rejection(cfg, e))?;
                let mut controller = rebuilt.controller;
                controller.reset();
                match self.simulate(controller.as_mut(), Plant::Dynamics(dynamics.as_ref())) {
                    Ok(traj) => {
                        let cost = self.task.cost().evaluate(&traj);
                        info!(
                            "True dynamics cost {:.6}, final state {:?}",
                            cost,
                            traj.final_obs().unwrap_or_default()
                        );
                        (Some(cost), Some(TrajectoryData::from(&traj)))
                    }
                    Err(e) if e.is_numerical() => {
                        warn!("True dynamics simulation failed for {}: {}", cfg, e);
                        (Some(f64::INFINITY), None)
                    }
                    Err(e) => return Err(fault(e)),
                }
            }
        };

        Ok(EvalInfo {
            surr_cost,
            surr_traj,
            surr_rejection,
            truedyn_cost,
            truedyn_traj,
        })
    }

    fn simulate(
        &self,
        controller: &mut dyn Controller,
        plant: Plant<'_>,
    ) -> Result<Trajectory, SimulationError> {
        simulate(
            controller,
            self.task.system(),
            self.task.init_obs(),
            self.task.term_cond(),
            plant,
            self.task.ctrl_bounds(),
            self.task.num_steps(),
        )
    }
}

fn rejection(cfg: &Configuration, err: PipelineError) -> RejectionReason {
    match err {
        PipelineError::Incompatible { message } => {
            warn!("Incompatible configuration {}: {}", cfg, message);
            RejectionReason::Incompatible { message }
        }
        other => fault(other),
    }
}

fn fault(err: impl std::fmt::Display) -> RejectionReason {
    RejectionReason::Fault {
        message: err.to_string(),
    }
}
