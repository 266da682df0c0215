//! Bootstrap ensemble evaluation of a controller.
//!
//! The surrogate is retrained on `n` with-replacement resamples of the
//! trajectory pool. Simulating a controller against each resampled model
//! yields a distribution of costs instead of a single number.

use ct_types::{
    config_error, simulate, validation_error, Controller, CostDistribution, CtResult, Model,
    Plant, System, Task, Trajectory, TrajectoryData,
};
use rand::{Rng, RngCore};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::surrogate::{acquire_surrogate, SurrogateMode};

/// Outcome of simulating against one bootstrap model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapJobResult {
    pub job: usize,
    #[serde(with = "ct_types::float_serde")]
    pub cost: f64,
    pub traj: Option<TrajectoryData>,
}

/// Per-model costs and trajectories, in job order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapInfo {
    #[serde(with = "ct_types::float_serde::vec")]
    pub costs: Vec<f64>,
    pub trajs: Vec<Option<TrajectoryData>>,
}

/// Draw `pool.len()` items from `pool` uniformly with replacement.
pub fn bootstrap_sample<T: Clone, R: Rng + ?Sized>(pool: &[T], rng: &mut R) -> Vec<T> {
    (0..pool.len())
        .map(|_| pool[rng.gen_range(0..pool.len())].clone())
        .collect()
}

pub struct BootstrapEvaluator {
    task: Task,
    models: Vec<Box<dyn Model>>,
}

impl BootstrapEvaluator {
    /// Train `n_bootstraps` untrained clones of `base`, each on its own
    /// resample of `pool`.
    pub fn new(
        base: &dyn Model,
        pool: &[Trajectory],
        task: Task,
        n_bootstraps: usize,
        rng: &mut dyn RngCore,
    ) -> CtResult<Self> {
        if n_bootstraps == 0 {
            return Err(config_error!("n_bootstraps must be at least 1"));
        }
        if pool.is_empty() {
            return Err(config_error!("bootstrap pool is empty"));
        }

        let mut models = Vec::with_capacity(n_bootstraps);
        for i in 0..n_bootstraps {
            let sample = bootstrap_sample(pool, rng);
            let mut model = base.clone_untrained();
            model.train(&sample)?;
            debug!("Trained bootstrap model {} on {} trajectories", i, sample.len());
            models.push(model);
        }
        info!(
            "Prepared {} bootstrap {} models from {} trajectories",
            n_bootstraps,
            base.name(),
            pool.len()
        );

        Ok(Self { task, models })
    }

    /// Acquire the base surrogate on `pool` via `mode`, then bootstrap it.
    pub fn from_mode(
        mode: &SurrogateMode,
        system: &System,
        pool: &[Trajectory],
        task: Task,
        n_bootstraps: usize,
        rng: &mut dyn RngCore,
        tune_iters: usize,
    ) -> CtResult<Self> {
        if n_bootstraps == 0 {
            return Err(config_error!("n_bootstraps must be at least 1"));
        }
        mode.validate()?;
        let (base, _) = acquire_surrogate(mode, system, pool, rng, tune_iters)?;
        Self::new(base.as_ref(), pool, task, n_bootstraps, rng)
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn models(&self) -> &[Box<dyn Model>] {
        &self.models
    }

    pub fn is_parallelizable(&self) -> bool {
        true
    }

    pub fn num_jobs(&self) -> usize {
        self.models.len()
    }

    /// Simulate `controller` against bootstrap model `job`.
    pub fn run_job(
        &self,
        controller: &mut dyn Controller,
        job: usize,
    ) -> CtResult<BootstrapJobResult> {
        let model = self
            .models
            .get(job)
            .ok_or_else(|| validation_error!("bootstrap job {} out of range", job))?;

        debug!("Simulating surrogate trajectory for bootstrap model {}", job);
        controller.reset();
        let simulated = simulate(
            controller,
            self.task.system(),
            self.task.init_obs(),
            self.task.term_cond(),
            Plant::Model(model.as_ref()),
            self.task.ctrl_bounds(),
            self.task.num_steps(),
        );
        match simulated {
            Ok(traj) => {
                let cost = self.task.cost().evaluate(&traj);
                debug!("Bootstrap model {} cost {:.6}", job, cost);
                Ok(BootstrapJobResult {
                    job,
                    cost,
                    traj: Some(TrajectoryData::from(&traj)),
                })
            }
            Err(e) if e.is_numerical() => {
                warn!("Bootstrap model {} simulation failed: {}", job, e);
                Ok(BootstrapJobResult {
                    job,
                    cost: f64::INFINITY,
                    traj: None,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reduce job results to a cost distribution. The result does not depend
    /// on the order the jobs completed in, but every job must appear exactly
    /// once.
    pub fn aggregate_results(
        &self,
        mut results: Vec<BootstrapJobResult>,
    ) -> CtResult<(CostDistribution, BootstrapInfo)> {
        results.sort_by_key(|r| r.job);
        if results.len() != self.num_jobs() {
            return Err(validation_error!(
                "expected {} bootstrap results, got {}",
                self.num_jobs(),
                results.len()
            ));
        }
        if let Some((expected, r)) = results.iter().enumerate().find(|(i, r)| r.job != *i) {
            return Err(validation_error!(
                "bootstrap job {} is missing or duplicated (found {})",
                expected,
                r.job
            ));
        }
        let costs: Vec<f64> = results.iter().map(|r| r.cost).collect();
        let distribution = CostDistribution::from_samples(&costs)
            .ok_or_else(|| validation_error!("no bootstrap results to aggregate"))?;

        info!(
            "Surrogate distribution: mean {:.2} stddev {:.2}",
            distribution.mean(),
            distribution.std()
        );

        let info = BootstrapInfo {
            costs,
            trajs: results.into_iter().map(|r| r.traj).collect(),
        };
        Ok((distribution, info))
    }

    /// Run every job in order on the calling thread.
    pub fn evaluate(
        &self,
        controller: &mut dyn Controller,
    ) -> CtResult<(CostDistribution, BootstrapInfo)> {
        let results = (0..self.num_jobs())
            .map(|job| self.run_job(controller, job))
            .collect::<CtResult<Vec<_>>>()?;
        self.aggregate_results(results)
    }

    /// Run the jobs on the rayon pool, one forked controller per job.
    pub fn evaluate_parallel(
        &self,
        controller: &dyn Controller,
    ) -> CtResult<(CostDistribution, BootstrapInfo)> {
        let forks: Vec<Box<dyn Controller>> =
            (0..self.num_jobs()).map(|_| controller.fork()).collect();
        let results = forks
            .into_par_iter()
            .enumerate()
            .map(|(job, mut controller)| self.run_job(controller.as_mut(), job))
            .collect::<CtResult<Vec<_>>>()?;
        self.aggregate_results(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn sample_has_pool_size_and_members() {
        let pool: Vec<u32> = (0..13).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..20 {
            let sample = bootstrap_sample(&pool, &mut rng);
            assert_eq!(sample.len(), pool.len());
            assert!(sample.iter().all(|x| pool.contains(x)));
        }
    }

    #[test]
    fn sample_draws_with_replacement() {
        let pool: Vec<u32> = (0..50).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut sample = bootstrap_sample(&pool, &mut rng);
        sample.sort();
        sample.dedup();
        assert!(sample.len() < pool.len());
    }

    #[test]
    fn single_item_pool() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(bootstrap_sample(&["only"], &mut rng), vec!["only"]);
        assert!(bootstrap_sample::<u8, _>(&[], &mut rng).is_empty());
    }
}
