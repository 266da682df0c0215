//! Search strategies over a [`ConfigurationSpace`].
//!
//! Strategies work in the unit hypercube of the space and decode back to
//! configurations, so conditional parameters appear only when active.

use ct_types::{Configuration, ConfigurationSpace, ParameterKind};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};

/// Common trait for all search strategies.
pub trait SearchStrategy: Send {
    /// Generate the next batch of configurations to evaluate.
    fn suggest(&mut self, count: usize, rng: &mut dyn RngCore) -> Vec<Configuration>;

    /// Report a completed run so adaptive strategies can learn. `loss` is
    /// always "lower is better".
    fn report(&mut self, _cfg: &Configuration, _loss: f64) {}

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

// ---- Latin hypercube ----

/// Space-filling design: every parameter's unit interval is cut into `n`
/// strata and each stratum is used exactly once.
#[derive(Debug, Clone)]
pub struct LatinHypercube {
    space: ConfigurationSpace,
}

impl LatinHypercube {
    pub fn new(space: ConfigurationSpace) -> Self {
        Self { space }
    }

    fn points(&self, n: usize, rng: &mut dyn RngCore) -> Vec<Vec<f64>> {
        let dims = self.space.len();
        let mut points = vec![vec![0.0; dims]; n];
        for d in 0..dims {
            let mut strata: Vec<usize> = (0..n).collect();
            strata.shuffle(rng);
            for (point, stratum) in points.iter_mut().zip(strata) {
                point[d] = (stratum as f64 + rng.gen::<f64>()) / n as f64;
            }
        }
        points
    }
}

impl SearchStrategy for LatinHypercube {
    fn suggest(&mut self, count: usize, rng: &mut dyn RngCore) -> Vec<Configuration> {
        if count == 0 {
            return Vec::new();
        }
        self.points(count, rng)
            .iter()
            .map(|p| self.space.from_unit_vector(p))
            .collect()
    }

    fn name(&self) -> &str {
        "latin_hypercube"
    }
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: ConfigurationSpace,
}

impl RandomSearch {
    pub fn new(space: ConfigurationSpace) -> Self {
        Self { space }
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self, count: usize, rng: &mut dyn RngCore) -> Vec<Configuration> {
        (0..count).map(|_| self.space.sample(rng)).collect()
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Bayesian search (local surrogate heuristic) ----

/// Model-guided search that tracks observed (configuration, loss) pairs and
/// biases sampling toward the best region found so far.
///
/// With probability `exploration_weight` a uniform sample is drawn;
/// otherwise the best observed point is perturbed in the unit hypercube.
#[derive(Debug, Clone)]
pub struct BayesianSearch {
    space: ConfigurationSpace,
    observations: Vec<(Configuration, f64)>,
    exploration_weight: f64,
    /// Perturbation half-width in unit coordinates.
    step: f64,
}

impl BayesianSearch {
    pub fn new(space: ConfigurationSpace, exploration_weight: f64) -> Self {
        Self {
            space,
            observations: Vec::new(),
            exploration_weight: exploration_weight.clamp(0.0, 1.0),
            step: 0.1,
        }
    }

    fn best(&self) -> Option<&Configuration> {
        self.observations
            .iter()
            .filter(|(_, loss)| loss.is_finite())
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(cfg, _)| cfg)
    }

    /// Pure exploration sample (same as random).
    fn explore(&self, rng: &mut dyn RngCore) -> Configuration {
        self.space.sample(rng)
    }

    /// Exploitation: perturb the best-known point.
    fn exploit(&self, base: &Configuration, rng: &mut dyn RngCore) -> Configuration {
        let mut point = self.space.to_unit_vector(base);
        for (u, param) in point.iter_mut().zip(&self.space.parameters) {
            match param.kind {
                ParameterKind::Choice { .. } => {
                    if rng.gen::<f64>() < 0.2 {
                        *u = rng.gen::<f64>();
                    }
                }
                _ => {
                    let noise = rng.gen_range(-self.step..self.step);
                    *u = (*u + noise).clamp(0.0, 1.0);
                }
            }
        }
        self.space.from_unit_vector(&point)
    }
}

impl SearchStrategy for BayesianSearch {
    fn suggest(&mut self, count: usize, rng: &mut dyn RngCore) -> Vec<Configuration> {
        (0..count)
            .map(|_| match self.best() {
                Some(best) if rng.gen::<f64>() >= self.exploration_weight => {
                    self.exploit(best, rng)
                }
                _ => self.explore(rng),
            })
            .collect()
    }

    fn report(&mut self, cfg: &Configuration, loss: f64) {
        self.observations.push((cfg.clone(), loss));
    }

    fn name(&self) -> &str {
        "bayesian"
    }
}
