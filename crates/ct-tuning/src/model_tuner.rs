//! Surrogate model tuning: holdout scoring and joint search over model
//! families.

use std::sync::Arc;

use ct_optimizer::{InitialDesign, RunHistory, Scenario, Smbo, TrialOutcome};
use ct_types::{
    config_error, Condition, Configuration, ConfigurationSpace, CtError, CtResult, Model,
    ModelFactory, ParameterDef, ParameterValue, SharedFactory, System, Trajectory,
};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Name of the categorical parameter that selects the model family.
pub const MODEL_PARAMETER: &str = "model";

/// One-step prediction error metric; lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMetric {
    #[default]
    Rmse,
    Mae,
}

impl ModelMetric {
    fn score(&self, errors: &[f64]) -> f64 {
        if errors.is_empty() {
            return f64::INFINITY;
        }
        let n = errors.len() as f64;
        match self {
            Self::Rmse => (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt(),
            Self::Mae => errors.iter().map(|e| e.abs()).sum::<f64>() / n,
        }
    }
}

/// Scores one model configuration.
pub trait ModelEvaluator: Send + Sync {
    fn evaluate(&self, factory: &dyn ModelFactory, cfg: &Configuration) -> CtResult<f64>;
}

/// Trains on one part of the data and scores one-step predictions on the
/// held-out rest.
pub struct HoldoutModelEvaluator {
    system: System,
    training: Vec<Trajectory>,
    holdout: Vec<Trajectory>,
    metric: ModelMetric,
}

impl HoldoutModelEvaluator {
    pub fn new(
        system: &System,
        trajs: &[Trajectory],
        holdout_prop: f64,
        metric: ModelMetric,
        rng: &mut dyn RngCore,
    ) -> CtResult<Self> {
        if trajs.iter().any(|t| t.system() != system) {
            return Err(config_error!("holdout trajectories do not match the system"));
        }
        if trajs.len() < 2 {
            return Err(config_error!(
                "holdout evaluation needs at least 2 trajectories, got {}",
                trajs.len()
            ));
        }
        if !(holdout_prop > 0.0 && holdout_prop < 1.0) {
            return Err(config_error!(
                "holdout proportion must be in (0, 1), got {}",
                holdout_prop
            ));
        }

        let mut shuffled = trajs.to_vec();
        shuffled.shuffle(rng);
        let n = shuffled.len();
        let n_holdout = ((n as f64 * holdout_prop).round() as usize).clamp(1, n - 1);
        let holdout = shuffled.split_off(n - n_holdout);

        Ok(Self {
            system: system.clone(),
            training: shuffled,
            holdout,
            metric,
        })
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn training(&self) -> &[Trajectory] {
        &self.training
    }

    pub fn holdout(&self) -> &[Trajectory] {
        &self.holdout
    }

    fn prediction_errors(&self, model: &dyn Model) -> CtResult<Option<Vec<f64>>> {
        let mut errors = Vec::new();
        for traj in &self.holdout {
            let obs = traj.obs();
            let ctrls = traj.ctrls();
            for t in 0..traj.len().saturating_sub(1) {
                let pred = match model.pred(&obs[t], &ctrls[t]) {
                    Ok(pred) => pred,
                    Err(e) if e.is_numerical() => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                for (p, actual) in pred.iter().zip(&obs[t + 1]) {
                    let err = p - actual;
                    if !err.is_finite() {
                        return Ok(None);
                    }
                    errors.push(err);
                }
            }
        }
        Ok(Some(errors))
    }
}

impl ModelEvaluator for HoldoutModelEvaluator {
    fn evaluate(&self, factory: &dyn ModelFactory, cfg: &Configuration) -> CtResult<f64> {
        let model = factory.build(cfg, &self.training)?;
        let score = match self.prediction_errors(model.as_ref())? {
            Some(errors) => self.metric.score(&errors),
            None => f64::INFINITY,
        };
        debug!("{} {} holdout {:?} = {}", factory.name(), cfg, self.metric, score);
        Ok(score)
    }
}

/// History of a surrogate tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTuneResult {
    /// Joint configuration of the best model, including the `model` label.
    pub inc_cfg: Configuration,
    pub cfgs: Vec<Configuration>,
    #[serde(with = "ct_types::float_serde::vec")]
    pub costs: Vec<f64>,
    /// `None` until the first successful run.
    pub inc_cfgs: Vec<Option<Configuration>>,
    #[serde(with = "ct_types::float_serde::vec")]
    pub inc_costs: Vec<f64>,
}

impl ModelTuneResult {
    /// Running incumbent over `history`. Crashed and NaN-scored runs are
    /// listed but never become the incumbent.
    pub fn from_history(inc_cfg: Configuration, history: &RunHistory<()>) -> Self {
        let mut result = Self {
            inc_cfg,
            cfgs: Vec::with_capacity(history.len()),
            costs: Vec::with_capacity(history.len()),
            inc_cfgs: Vec::with_capacity(history.len()),
            inc_costs: Vec::with_capacity(history.len()),
        };
        let mut best: Option<&Configuration> = None;
        let mut best_cost = f64::INFINITY;
        for record in history.records() {
            let improves = record.is_success()
                && !record.cost.is_nan()
                && (best.is_none() || record.cost < best_cost);
            if improves {
                best = Some(&record.configuration);
                best_cost = record.cost;
            }
            result.cfgs.push(record.configuration.clone());
            result.costs.push(record.cost);
            result.inc_cfgs.push(best.cloned());
            result.inc_costs.push(best_cost);
        }
        result
    }

    /// Family label of the selected model.
    pub fn model_label(&self) -> Option<&str> {
        self.inc_cfg.get_str(MODEL_PARAMETER)
    }
}

/// Selects and tunes a surrogate model over registered factories.
pub trait ModelTuner {
    fn add_model_factory(&mut self, label: &str, factory: SharedFactory) -> CtResult<()>;

    fn run(
        &mut self,
        rng: &mut dyn RngCore,
        n_iters: usize,
    ) -> CtResult<(Box<dyn Model>, ModelTuneResult)>;
}

/// Model tuner driven by the SMBO search over a joint space: a `model`
/// choice plus each factory's parameters, prefixed `"{label}:"` and active
/// only while that label is selected.
pub struct SearchModelTuner {
    evaluator: Arc<dyn ModelEvaluator>,
    trajs: Vec<Trajectory>,
    factories: Vec<(String, SharedFactory)>,
}

impl SearchModelTuner {
    /// `trajs` trains the final model once the search has picked it.
    pub fn new(evaluator: Arc<dyn ModelEvaluator>, trajs: Vec<Trajectory>) -> Self {
        Self {
            evaluator,
            trajs,
            factories: Vec::new(),
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|(label, _)| label.as_str())
    }

    pub fn system(&self) -> Option<&System> {
        self.factories.first().map(|(_, f)| f.system())
    }

    /// The joint configuration space searched by [`ModelTuner::run`].
    pub fn joint_space(&self) -> ConfigurationSpace {
        let labels: Vec<&str> = self.labels().collect();
        let mut space = ConfigurationSpace::new().add(ParameterDef::choice(MODEL_PARAMETER, labels));
        for (label, factory) in &self.factories {
            let prefix = format!("{label}:");
            for param in factory.configuration_space().parameters {
                let condition = match param.condition {
                    Some(c) => Condition {
                        parent: format!("{prefix}{}", c.parent),
                        values: c.values,
                    },
                    None => Condition {
                        parent: MODEL_PARAMETER.to_string(),
                        values: vec![ParameterValue::from(label.as_str())],
                    },
                };
                space = space.add(ParameterDef {
                    name: format!("{prefix}{}", param.name),
                    condition: Some(condition),
                    ..param
                });
            }
        }
        space
    }

    /// Factory and model-local configuration selected by a joint
    /// configuration.
    pub fn resolve(&self, cfg: &Configuration) -> CtResult<(SharedFactory, Configuration)> {
        let label = cfg
            .get_str(MODEL_PARAMETER)
            .ok_or_else(|| config_error!("configuration {} has no model label", cfg))?;
        let factory = self
            .factories
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, f)| Arc::clone(f))
            .ok_or_else(|| config_error!("unknown model label {}", label))?;
        Ok((factory, cfg.strip_prefix(&format!("{label}:"))))
    }
}

impl ModelTuner for SearchModelTuner {
    fn add_model_factory(&mut self, label: &str, factory: SharedFactory) -> CtResult<()> {
        if label.is_empty() || label.contains(':') {
            return Err(config_error!("invalid model label {:?}", label));
        }
        if self.factories.iter().any(|(l, _)| l == label) {
            return Err(config_error!("model label {} registered twice", label));
        }
        factory.configuration_space().validate()?;
        self.factories.push((label.to_string(), factory));
        Ok(())
    }

    fn run(
        &mut self,
        rng: &mut dyn RngCore,
        n_iters: usize,
    ) -> CtResult<(Box<dyn Model>, ModelTuneResult)> {
        if self.factories.is_empty() {
            return Err(config_error!("no model factories registered"));
        }

        let space = self.joint_space();
        let seed = rng.gen_range(0..1u64 << 31);
        let scenario = Scenario::new("surrogate-tuning")
            .with_runcount_limit(n_iters)
            .with_deterministic(true)
            .with_abort_on_first_run_crash(false)
            .with_initial_design(InitialDesign::LatinHypercube, None);
        info!(
            "Tuning surrogate over {:?} for {} iterations",
            self.labels().collect::<Vec<_>>(),
            n_iters
        );

        let objective = |cfg: &Configuration| -> Result<TrialOutcome<()>, CtError> {
            let (factory, model_cfg) = self.resolve(cfg)?;
            let cost = self.evaluator.evaluate(factory.as_ref(), &model_cfg)?;
            Ok(TrialOutcome::new(cost, Some(())))
        };
        let mut smbo = Smbo::<()>::new(space, scenario, seed)?;
        let inc_cfg = smbo.optimize(&objective)?;

        let result = ModelTuneResult::from_history(inc_cfg.clone(), smbo.run_history());

        let (factory, model_cfg) = self.resolve(&inc_cfg)?;
        info!("Selected surrogate {} {}", factory.name(), model_cfg);
        let model = factory.build(&model_cfg, &self.trajs)?;
        Ok((model, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ct_optimizer::{RunRecord, RunStatus};
    use uuid::Uuid;

    fn history(entries: &[(f64, RunStatus)]) -> RunHistory<()> {
        let mut history = RunHistory::new();
        for (i, &(cost, status)) in entries.iter().enumerate() {
            history.push(RunRecord {
                id: Uuid::new_v4(),
                trial_number: i,
                configuration: Configuration::new().with("ridge", i as f64),
                cost,
                status,
                additional_info: (status == RunStatus::Success).then_some(()),
                error: None,
                started_at: Utc::now(),
                finished_at: Utc::now(),
            });
        }
        history
    }

    #[test]
    fn crashed_first_run_is_never_incumbent() {
        let history = history(&[
            (f64::INFINITY, RunStatus::Crashed),
            (f64::NAN, RunStatus::Success),
            (3.0, RunStatus::Success),
            (1.0, RunStatus::Crashed),
            (2.0, RunStatus::Success),
        ]);
        let inc = history.records()[4].configuration.clone();
        let result = ModelTuneResult::from_history(inc.clone(), &history);

        assert_eq!(result.cfgs.len(), 5);
        assert_eq!(result.inc_cfgs[0], None);
        assert_eq!(result.inc_cfgs[1], None);
        assert_eq!(result.inc_cfgs[2], Some(history.records()[2].configuration.clone()));
        assert_eq!(result.inc_cfgs[3], result.inc_cfgs[2]);
        assert_eq!(result.inc_cfgs[4], Some(inc));
        assert_eq!(
            result.inc_costs,
            vec![f64::INFINITY, f64::INFINITY, 3.0, 3.0, 2.0]
        );
    }

    #[test]
    fn metrics() {
        let errors = [3.0, -4.0];
        assert!((ModelMetric::Rmse.score(&errors) - 12.5f64.sqrt()).abs() < 1e-12);
        assert_eq!(ModelMetric::Mae.score(&errors), 3.5);
        assert_eq!(ModelMetric::Rmse.score(&[]), f64::INFINITY);
    }

    #[test]
    fn metric_parses_from_config() {
        let metric: ModelMetric = serde_json::from_str("\"mae\"").unwrap();
        assert_eq!(metric, ModelMetric::Mae);
        assert_eq!(ModelMetric::default(), ModelMetric::Rmse);
    }
}
