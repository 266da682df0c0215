//! Surrogate acquisition: how the model that stands in for the real system
//! during tuning is obtained.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ct_types::{
    config_error, Configuration, CtResult, Model, ModelFamily, SharedFactory, System, Trajectory,
};
use rand::seq::SliceRandom;
use rand::RngCore;
use tracing::info;

use crate::model_tuner::{
    HoldoutModelEvaluator, ModelEvaluator, ModelMetric, ModelTuneResult, ModelTuner,
    SearchModelTuner,
};

/// Settings for the `Autotune` and `Autoselect` modes.
#[derive(Clone)]
pub struct SurrogateTuning {
    /// Overrides the default holdout evaluator.
    pub evaluator: Option<Arc<dyn ModelEvaluator>>,
    pub holdout_prop: f64,
    pub metric: ModelMetric,
}

impl Default for SurrogateTuning {
    fn default() -> Self {
        Self {
            evaluator: None,
            holdout_prop: 0.25,
            metric: ModelMetric::Rmse,
        }
    }
}

impl SurrogateTuning {
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ModelEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_holdout_prop(mut self, prop: f64) -> Self {
        self.holdout_prop = prop;
        self
    }

    pub fn with_metric(mut self, metric: ModelMetric) -> Self {
        self.metric = metric;
        self
    }

    fn validate(&self) -> CtResult<()> {
        if self.evaluator.is_none() && !(self.holdout_prop > 0.0 && self.holdout_prop < 1.0) {
            return Err(config_error!(
                "surrogate holdout proportion must be in (0, 1), got {}",
                self.holdout_prop
            ));
        }
        Ok(())
    }

    fn evaluator(
        &self,
        system: &System,
        trajs: &[Trajectory],
        rng: &mut dyn RngCore,
    ) -> CtResult<Arc<dyn ModelEvaluator>> {
        match &self.evaluator {
            Some(evaluator) => Ok(Arc::clone(evaluator)),
            None => Ok(Arc::new(HoldoutModelEvaluator::new(
                system,
                trajs,
                self.holdout_prop,
                self.metric,
                rng,
            )?)),
        }
    }
}

impl fmt::Debug for SurrogateTuning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurrogateTuning")
            .field("custom_evaluator", &self.evaluator.is_some())
            .field("holdout_prop", &self.holdout_prop)
            .field("metric", &self.metric)
            .finish()
    }
}

/// Factories for the model families searched by `Autoselect`.
#[derive(Clone, Default)]
pub struct FactoryCatalog {
    factories: BTreeMap<ModelFamily, SharedFactory>,
}

impl FactoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, family: ModelFamily, factory: SharedFactory) -> Self {
        self.insert(family, factory);
        self
    }

    pub fn insert(&mut self, family: ModelFamily, factory: SharedFactory) {
        self.factories.insert(family, factory);
    }

    pub fn get(&self, family: ModelFamily) -> Option<&SharedFactory> {
        self.factories.get(&family)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Families without a registered factory.
    pub fn missing(&self) -> Vec<ModelFamily> {
        ModelFamily::ALL
            .into_iter()
            .filter(|f| !self.factories.contains_key(f))
            .collect()
    }

    /// Registered factories in search order.
    pub fn entries(&self) -> impl Iterator<Item = (ModelFamily, &SharedFactory)> {
        ModelFamily::ALL
            .into_iter()
            .filter_map(move |family| self.factories.get(&family).map(|f| (family, f)))
    }
}

impl fmt::Debug for FactoryCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

/// How the surrogate model is obtained.
#[derive(Clone)]
pub enum SurrogateMode {
    /// Train the factory's default configuration.
    DefaultCfg { factory: SharedFactory, split: f64 },
    /// Train a caller-supplied configuration.
    FixedCfg {
        factory: SharedFactory,
        cfg: Configuration,
        split: f64,
    },
    /// Tune the factory's hyperparameters.
    Autotune {
        factory: SharedFactory,
        split: f64,
        tuning: SurrogateTuning,
    },
    /// Tune jointly over every model family.
    Autoselect {
        catalog: FactoryCatalog,
        split: f64,
        tuning: SurrogateTuning,
    },
    /// Use a surrogate trained elsewhere, passed to the tuner's `run`.
    Pretrain,
}

impl SurrogateMode {
    pub fn default_cfg(factory: SharedFactory, split: f64) -> CtResult<Self> {
        Self::validated(Self::DefaultCfg { factory, split })
    }

    pub fn fixed_cfg(factory: SharedFactory, cfg: Configuration, split: f64) -> CtResult<Self> {
        Self::validated(Self::FixedCfg {
            factory,
            cfg,
            split,
        })
    }

    pub fn autotune(factory: SharedFactory, split: f64, tuning: SurrogateTuning) -> CtResult<Self> {
        Self::validated(Self::Autotune {
            factory,
            split,
            tuning,
        })
    }

    pub fn autoselect(catalog: FactoryCatalog, split: f64, tuning: SurrogateTuning) -> CtResult<Self> {
        Self::validated(Self::Autoselect {
            catalog,
            split,
            tuning,
        })
    }

    pub fn pretrain() -> Self {
        Self::Pretrain
    }

    fn validated(mode: Self) -> CtResult<Self> {
        mode.validate()?;
        Ok(mode)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::DefaultCfg { .. } => "defaultcfg",
            Self::FixedCfg { .. } => "fixedcfg",
            Self::Autotune { .. } => "autotune",
            Self::Autoselect { .. } => "autoselect",
            Self::Pretrain => "pretrain",
        }
    }

    /// Fraction of trajectories routed to surrogate training.
    pub fn split(&self) -> Option<f64> {
        match self {
            Self::DefaultCfg { split, .. }
            | Self::FixedCfg { split, .. }
            | Self::Autotune { split, .. }
            | Self::Autoselect { split, .. } => Some(*split),
            Self::Pretrain => None,
        }
    }

    pub fn validate(&self) -> CtResult<()> {
        if let Some(split) = self.split() {
            if !(split > 0.0 && split < 1.0) {
                return Err(config_error!(
                    "surrogate split must be in (0, 1) for {}, got {}",
                    self.name(),
                    split
                ));
            }
        }
        match self {
            Self::FixedCfg { factory, cfg, .. } => {
                factory
                    .configuration_space()
                    .check_configuration(cfg)
                    .map_err(|e| {
                        config_error!("fixed surrogate configuration for {}: {}", factory.name(), e)
                    })?;
            }
            Self::Autotune { tuning, .. } => tuning.validate()?,
            Self::Autoselect { catalog, tuning, .. } => {
                let missing = catalog.missing();
                if !missing.is_empty() {
                    return Err(config_error!(
                        "autoselect catalog is missing factories for {:?}",
                        missing
                    ));
                }
                tuning.validate()?;
            }
            Self::DefaultCfg { .. } | Self::Pretrain => {}
        }
        Ok(())
    }
}

impl fmt::Debug for SurrogateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SurrogateMode");
        d.field("mode", &self.name());
        if let Some(split) = self.split() {
            d.field("split", &split);
        }
        d.finish()
    }
}

/// Shuffle `trajs` and route `floor(split * n)` of them to surrogate
/// training; the rest go to system identification.
pub fn split_trajectories(
    trajs: &[Trajectory],
    split: f64,
    rng: &mut dyn RngCore,
) -> (Vec<Trajectory>, Vec<Trajectory>) {
    let mut shuffled = trajs.to_vec();
    shuffled.shuffle(rng);
    let n_surr = ((split * shuffled.len() as f64).floor() as usize).min(shuffled.len());
    let sysid = shuffled.split_off(n_surr);
    (shuffled, sysid)
}

/// Obtain a trained surrogate on `trajs` according to `mode`. Tuning modes
/// also return the tuning history.
pub fn acquire_surrogate(
    mode: &SurrogateMode,
    system: &System,
    trajs: &[Trajectory],
    rng: &mut dyn RngCore,
    tune_iters: usize,
) -> CtResult<(Arc<dyn Model>, Option<ModelTuneResult>)> {
    info!(
        "Acquiring surrogate ({}) from {} trajectories",
        mode.name(),
        trajs.len()
    );
    match mode {
        SurrogateMode::DefaultCfg { factory, .. } => {
            let cfg = factory.configuration_space().default_configuration();
            let model = factory.build(&cfg, trajs)?;
            Ok((Arc::from(model), None))
        }
        SurrogateMode::FixedCfg { factory, cfg, .. } => {
            let model = factory.build(cfg, trajs)?;
            Ok((Arc::from(model), None))
        }
        SurrogateMode::Autotune {
            factory, tuning, ..
        } => {
            let evaluator = tuning.evaluator(system, trajs, rng)?;
            let mut tuner = SearchModelTuner::new(evaluator, trajs.to_vec());
            tuner.add_model_factory(factory.name(), Arc::clone(factory))?;
            let (model, result) = tuner.run(rng, tune_iters)?;
            Ok((Arc::from(model), Some(result)))
        }
        SurrogateMode::Autoselect {
            catalog, tuning, ..
        } => {
            let evaluator = tuning.evaluator(system, trajs, rng)?;
            let mut tuner = SearchModelTuner::new(evaluator, trajs.to_vec());
            for (family, factory) in catalog.entries() {
                tuner.add_model_factory(family.label(), Arc::clone(factory))?;
            }
            let (model, result) = tuner.run(rng, tune_iters)?;
            Ok((Arc::from(model), Some(result)))
        }
        SurrogateMode::Pretrain => Err(config_error!(
            "pretrain mode needs a surrogate supplied to run"
        )),
    }
}
