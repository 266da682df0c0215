//! Shared fixtures on top of the scalar reference problem: trajectory
//! generators, a pipeline with injectable faults and recording wrappers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ct_tuning::reference::{self, LinearPlant};
use ct_tuning::FactoryCatalog;
use ct_types::{
    Configuration, ConfigurationSpace, Dynamics, Model, ModelError, ModelFactory, ModelFamily,
    ModelSnapshot, Pipeline, PipelineError, PipelineOutput, SimulationError, System, Task,
    Trajectory,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub use ct_tuning::reference::{system, task, GainController, LeastSquaresFactory, QuadraticCost};

pub const PLANT_A: f64 = LinearPlant::REFERENCE.a;
pub const PLANT_B: f64 = LinearPlant::REFERENCE.b;

pub fn plant() -> Arc<dyn Dynamics> {
    Arc::new(LinearPlant::REFERENCE)
}

pub fn lsq() -> Arc<dyn ModelFactory> {
    Arc::new(LeastSquaresFactory::new())
}

/// `n` noiseless plant rollouts of 10 steps under random controls.
pub fn make_trajs(n: usize, seed: u64) -> Vec<Trajectory> {
    make_trajs_with(PLANT_A, PLANT_B, n, seed)
}

/// Rollouts of `x' = a x + b u`.
pub fn make_trajs_with(a: f64, b: f64, n: usize, seed: u64) -> Vec<Trajectory> {
    let system = system();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let mut x: f64 = rng.gen_range(-1.0..1.0);
            let mut obs = Vec::new();
            let mut ctrls = Vec::new();
            for _ in 0..10 {
                let u: f64 = rng.gen_range(-1.0..1.0);
                obs.push(vec![x]);
                ctrls.push(vec![u]);
                x = a * x + b * u;
            }
            obs.push(vec![x]);
            ctrls.push(vec![0.0]);
            Trajectory::from_rows(&system, obs, ctrls).expect("fixture rows match the system")
        })
        .collect()
}

/// Trajectories that carry no excitation; least squares on them is singular.
pub fn zero_trajs(n: usize) -> Vec<Trajectory> {
    (0..n).map(|_| Trajectory::zeros(&system(), 10)).collect()
}

/// One least-squares factory per model family, labelled as that family.
pub fn full_catalog() -> FactoryCatalog {
    ModelFamily::ALL
        .into_iter()
        .fold(FactoryCatalog::new(), |catalog, family| {
            catalog.with(family, Arc::new(LeastSquaresFactory::named(family.label())))
        })
}

// ---- Fault injection ----

/// The reference gain pipeline, misbehaving above configurable gains.
pub struct FaultyPipeline {
    inner: reference::GainPipeline,
    panic_above: Option<f64>,
    hang_above: Option<f64>,
}

impl FaultyPipeline {
    pub fn new() -> Self {
        Self {
            inner: reference::GainPipeline::new(),
            panic_above: None,
            hang_above: None,
        }
    }

    pub fn incompatible_above(mut self, gain: f64) -> Self {
        self.inner = self.inner.with_max_gain(gain);
        self
    }

    pub fn panic_above(mut self, gain: f64) -> Self {
        self.panic_above = Some(gain);
        self
    }

    pub fn hang_above(mut self, gain: f64) -> Self {
        self.hang_above = Some(gain);
        self
    }
}

impl Pipeline for FaultyPipeline {
    fn system(&self) -> &System {
        self.inner.system()
    }

    fn configuration_space(&self) -> ConfigurationSpace {
        self.inner.configuration_space()
    }

    fn build(
        &self,
        cfg: &Configuration,
        task: &Task,
        trajs: &[Trajectory],
        model: Option<Arc<dyn Model>>,
    ) -> Result<PipelineOutput, PipelineError> {
        let gain = cfg.get_f64("gain").unwrap_or(0.0);
        if self.panic_above.is_some_and(|limit| gain > limit) {
            panic!("controller synthesis blew up at gain {gain}");
        }
        if self.hang_above.is_some_and(|limit| gain > limit) {
            thread::sleep(Duration::from_secs(3));
        }
        self.inner.build(cfg, task, trajs, model)
    }
}

// ---- Recording wrappers ----

/// What a [`RecordingModel`] and its untrained clones were asked to do.
#[derive(Default)]
pub struct ModelLog {
    pub train_sizes: Mutex<Vec<usize>>,
    pub preds: AtomicUsize,
}

impl ModelLog {
    pub fn train_sizes(&self) -> Vec<usize> {
        self.train_sizes.lock().unwrap().clone()
    }

    pub fn preds(&self) -> usize {
        self.preds.load(Ordering::SeqCst)
    }
}

pub struct RecordingModel {
    inner: Box<dyn Model>,
    log: Arc<ModelLog>,
}

impl RecordingModel {
    pub fn new(inner: Box<dyn Model>) -> (Self, Arc<ModelLog>) {
        let log = Arc::new(ModelLog::default());
        (
            Self {
                inner,
                log: Arc::clone(&log),
            },
            log,
        )
    }
}

impl Model for RecordingModel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn configuration(&self) -> &Configuration {
        self.inner.configuration()
    }

    fn system(&self) -> &System {
        self.inner.system()
    }

    fn is_trained(&self) -> bool {
        self.inner.is_trained()
    }

    fn train(&mut self, trajs: &[Trajectory]) -> Result<(), ModelError> {
        self.log.train_sizes.lock().unwrap().push(trajs.len());
        self.inner.train(trajs)
    }

    fn clone_untrained(&self) -> Box<dyn Model> {
        Box::new(Self {
            inner: self.inner.clone_untrained(),
            log: Arc::clone(&self.log),
        })
    }

    fn pred(&self, obs: &[f64], ctrl: &[f64]) -> Result<Vec<f64>, SimulationError> {
        self.log.preds.fetch_add(1, Ordering::SeqCst);
        self.inner.pred(obs, ctrl)
    }

    fn snapshot(&self) -> Result<ModelSnapshot, ModelError> {
        self.inner.snapshot()
    }
}

/// Logs every configuration the wrapped pipeline is built with.
pub struct RecordingPipeline {
    inner: Arc<dyn Pipeline>,
    sanity: Configuration,
    built: Mutex<Vec<Configuration>>,
}

impl RecordingPipeline {
    pub fn new(inner: Arc<dyn Pipeline>, sanity: Configuration) -> Self {
        Self {
            inner,
            sanity,
            built: Mutex::new(Vec::new()),
        }
    }

    pub fn built(&self) -> Vec<Configuration> {
        self.built.lock().unwrap().clone()
    }
}

impl Pipeline for RecordingPipeline {
    fn system(&self) -> &System {
        self.inner.system()
    }

    fn configuration_space(&self) -> ConfigurationSpace {
        self.inner.configuration_space()
    }

    fn build(
        &self,
        cfg: &Configuration,
        task: &Task,
        trajs: &[Trajectory],
        model: Option<Arc<dyn Model>>,
    ) -> Result<PipelineOutput, PipelineError> {
        self.built.lock().unwrap().push(cfg.clone());
        self.inner.build(cfg, task, trajs, model)
    }

    fn sanity_configuration(&self) -> Configuration {
        self.sanity.clone()
    }
}
