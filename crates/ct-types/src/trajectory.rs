//! Systems, trajectories and their by-value transfer form.

use serde::{Deserialize, Serialize};

use crate::errors::SimulationError;

/// Observation and control layout of a controlled system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct System {
    pub observations: Vec<String>,
    pub controls: Vec<String>,
    /// Sample period in seconds.
    pub dt: f64,
}

impl System {
    pub fn new<S: Into<String>>(
        observations: impl IntoIterator<Item = S>,
        controls: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            observations: observations.into_iter().map(Into::into).collect(),
            controls: controls.into_iter().map(Into::into).collect(),
            dt: 1.0,
        }
    }

    pub fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }

    pub fn obs_dim(&self) -> usize {
        self.observations.len()
    }

    pub fn ctrl_dim(&self) -> usize {
        self.controls.len()
    }
}

/// One (observation, control) pair of a trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeStep<'a> {
    pub obs: &'a [f64],
    pub ctrl: &'a [f64],
}

/// An ordered, fixed-length sequence of observation/control pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    system: System,
    obs: Vec<Vec<f64>>,
    ctrls: Vec<Vec<f64>>,
}

impl Trajectory {
    /// A trajectory of `len` zeroed steps.
    pub fn zeros(system: &System, len: usize) -> Self {
        Self {
            obs: vec![vec![0.0; system.obs_dim()]; len],
            ctrls: vec![vec![0.0; system.ctrl_dim()]; len],
            system: system.clone(),
        }
    }

    /// Build from explicit rows, checking their widths against `system`.
    pub fn from_rows(
        system: &System,
        obs: Vec<Vec<f64>>,
        ctrls: Vec<Vec<f64>>,
    ) -> Result<Self, SimulationError> {
        if obs.len() != ctrls.len() {
            return Err(SimulationError::DimensionMismatch {
                expected: obs.len(),
                actual: ctrls.len(),
            });
        }
        for row in &obs {
            if row.len() != system.obs_dim() {
                return Err(SimulationError::DimensionMismatch {
                    expected: system.obs_dim(),
                    actual: row.len(),
                });
            }
        }
        for row in &ctrls {
            if row.len() != system.ctrl_dim() {
                return Err(SimulationError::DimensionMismatch {
                    expected: system.ctrl_dim(),
                    actual: row.len(),
                });
            }
        }
        Ok(Self {
            system: system.clone(),
            obs,
            ctrls,
        })
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn len(&self) -> usize {
        self.obs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.obs.is_empty()
    }

    pub fn step(&self, i: usize) -> Option<TimeStep<'_>> {
        Some(TimeStep {
            obs: self.obs.get(i)?,
            ctrl: self.ctrls.get(i)?,
        })
    }

    pub fn obs(&self) -> &[Vec<f64>] {
        &self.obs
    }

    pub fn ctrls(&self) -> &[Vec<f64>] {
        &self.ctrls
    }

    pub fn final_obs(&self) -> Option<&[f64]> {
        self.obs.last().map(Vec::as_slice)
    }

    pub(crate) fn push(&mut self, obs: Vec<f64>, ctrl: Vec<f64>) {
        self.obs.push(obs);
        self.ctrls.push(ctrl);
    }

    pub(crate) fn set_last_ctrl(&mut self, ctrl: Vec<f64>) {
        if let Some(last) = self.ctrls.last_mut() {
            *last = ctrl;
        }
    }
}

/// Plain numeric form of a trajectory, used wherever a trajectory crosses a
/// process or serialization boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryData {
    pub obs: Vec<Vec<f64>>,
    pub ctrls: Vec<Vec<f64>>,
}

impl TrajectoryData {
    pub fn len(&self) -> usize {
        self.obs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.obs.is_empty()
    }

    /// Rebuild a trajectory of `system` from the stored sequences.
    pub fn to_trajectory(&self, system: &System) -> Result<Trajectory, SimulationError> {
        let mut traj = Trajectory::zeros(system, self.obs.len());
        if self.ctrls.len() != self.obs.len() {
            return Err(SimulationError::DimensionMismatch {
                expected: self.obs.len(),
                actual: self.ctrls.len(),
            });
        }
        for (dst, src) in traj.obs.iter_mut().zip(&self.obs) {
            if src.len() != dst.len() {
                return Err(SimulationError::DimensionMismatch {
                    expected: dst.len(),
                    actual: src.len(),
                });
            }
            dst.copy_from_slice(src);
        }
        for (dst, src) in traj.ctrls.iter_mut().zip(&self.ctrls) {
            if src.len() != dst.len() {
                return Err(SimulationError::DimensionMismatch {
                    expected: dst.len(),
                    actual: src.len(),
                });
            }
            dst.copy_from_slice(src);
        }
        Ok(traj)
    }
}

impl From<&Trajectory> for TrajectoryData {
    fn from(traj: &Trajectory) -> Self {
        Self {
            obs: traj.obs.clone(),
            ctrls: traj.ctrls.clone(),
        }
    }
}
