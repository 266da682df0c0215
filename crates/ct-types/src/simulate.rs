//! Closed-loop simulation of a controller against a model or true dynamics.

use crate::control::{Controller, Dynamics, TermCond};
use crate::errors::SimulationError;
use crate::model::Model;
use crate::trajectory::{System, Trajectory};

/// Step cap used when neither a step budget nor a bound is given.
pub const DEFAULT_MAX_STEPS: usize = 10_000;

/// What the controller is closed around.
#[derive(Clone, Copy)]
pub enum Plant<'a> {
    /// A learned surrogate.
    Model(&'a dyn Model),
    /// Ground-truth dynamics.
    Dynamics(&'a dyn Dynamics),
}

impl Plant<'_> {
    fn step(&self, obs: &[f64], ctrl: &[f64]) -> Result<Vec<f64>, SimulationError> {
        match self {
            Plant::Model(model) => model.pred(obs, ctrl),
            Plant::Dynamics(dynamics) => dynamics.step(obs, ctrl),
        }
    }
}

/// Simulate `controller` from `init_obs` for at most `max_steps` steps (or
/// [`DEFAULT_MAX_STEPS`]), stopping early once `term_cond` holds.
///
/// The returned trajectory holds `steps + 1` observations; the control row
/// paired with the final observation is zero.
pub fn simulate(
    controller: &mut dyn Controller,
    system: &System,
    init_obs: &[f64],
    term_cond: Option<&TermCond>,
    plant: Plant<'_>,
    ctrl_bounds: Option<&[(f64, f64)]>,
    max_steps: Option<usize>,
) -> Result<Trajectory, SimulationError> {
    if init_obs.len() != system.obs_dim() {
        return Err(SimulationError::DimensionMismatch {
            expected: system.obs_dim(),
            actual: init_obs.len(),
        });
    }

    let mut traj = Trajectory::zeros(system, 0);
    traj.push(init_obs.to_vec(), vec![0.0; system.ctrl_dim()]);
    let mut obs = init_obs.to_vec();

    for step in 0..max_steps.unwrap_or(DEFAULT_MAX_STEPS) {
        let mut ctrl = controller.run(&obs)?;
        if ctrl.len() != system.ctrl_dim() {
            return Err(SimulationError::DimensionMismatch {
                expected: system.ctrl_dim(),
                actual: ctrl.len(),
            });
        }
        if let Some(bounds) = ctrl_bounds {
            for (u, (low, high)) in ctrl.iter_mut().zip(bounds) {
                *u = u.clamp(*low, *high);
            }
        }

        let next = plant.step(&obs, &ctrl)?;
        if next.len() != system.obs_dim() {
            return Err(SimulationError::DimensionMismatch {
                expected: system.obs_dim(),
                actual: next.len(),
            });
        }
        if next.iter().any(|v| !v.is_finite()) {
            return Err(SimulationError::NonFinite { step: step + 1 });
        }

        traj.set_last_ctrl(ctrl);
        traj.push(next.clone(), vec![0.0; system.ctrl_dim()]);
        obs = next;

        if term_cond.map(|cond| cond(&traj)).unwrap_or(false) {
            break;
        }
    }

    Ok(traj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Gain(f64);

    impl Controller for Gain {
        fn reset(&mut self) {}

        fn run(&mut self, obs: &[f64]) -> Result<Vec<f64>, SimulationError> {
            Ok(vec![-self.0 * obs[0]])
        }

        fn fork(&self) -> Box<dyn Controller> {
            Box::new(Gain(self.0))
        }
    }

    fn system() -> System {
        System::new(["x"], ["u"])
    }

    fn integrator(obs: &[f64], ctrl: &[f64]) -> Result<Vec<f64>, SimulationError> {
        Ok(vec![obs[0] + ctrl[0]])
    }

    #[test]
    fn runs_fixed_number_of_steps() {
        let mut ctrl = Gain(0.5);
        let traj = simulate(
            &mut ctrl,
            &system(),
            &[1.0],
            None,
            Plant::Dynamics(&integrator),
            None,
            Some(3),
        )
        .unwrap();

        assert_eq!(traj.len(), 4);
        assert_eq!(traj.obs()[3], vec![0.125]);
        assert_eq!(traj.ctrls()[0], vec![-0.5]);
        assert_eq!(traj.ctrls()[3], vec![0.0]);
    }

    #[test]
    fn stops_on_termination_condition() {
        let mut ctrl = Gain(0.5);
        let done: TermCond = Arc::new(|traj: &Trajectory| traj.final_obs().unwrap()[0] < 0.3);
        let traj = simulate(
            &mut ctrl,
            &system(),
            &[1.0],
            Some(&done),
            Plant::Dynamics(&integrator),
            None,
            None,
        )
        .unwrap();

        assert_eq!(traj.len(), 3);
    }

    #[test]
    fn clips_controls_to_bounds() {
        let mut ctrl = Gain(10.0);
        let traj = simulate(
            &mut ctrl,
            &system(),
            &[1.0],
            None,
            Plant::Dynamics(&integrator),
            Some(&[(-0.25, 0.25)][..]),
            Some(1),
        )
        .unwrap();

        assert_eq!(traj.ctrls()[0], vec![-0.25]);
        assert_eq!(traj.obs()[1], vec![0.75]);
    }

    #[test]
    fn diverging_dynamics_is_numerical_failure() {
        let mut ctrl = Gain(0.0);
        let blow_up = |obs: &[f64], _: &[f64]| -> Result<Vec<f64>, SimulationError> {
            Ok(vec![obs[0] * 1e300])
        };
        let err = simulate(
            &mut ctrl,
            &system(),
            &[10.0],
            None,
            Plant::Dynamics(&blow_up),
            None,
            Some(5),
        )
        .unwrap_err();

        assert!(err.is_numerical());
    }
}
