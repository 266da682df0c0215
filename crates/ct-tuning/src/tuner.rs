//! Pipeline tuning orchestration.
//!
//! [`PipelineTuner::run`] acquires a surrogate, evaluates pipeline
//! configurations against it behind an isolated worker, drives the SMBO
//! search and folds the run history into a [`TuningResult`].

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use chrono::{DateTime, Utc};
use ct_optimizer::{InitialDesign, RunHistory, Scenario, Smbo};
use ct_types::{
    config_error, Configuration, Controller, CtError, CtResult, Dynamics, Model, Pipeline,
    SearchError, System, Task, Trajectory,
};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::evaluator::{ConfigEvaluator, EvalInfo};
use crate::model_tuner::ModelTuneResult;
use crate::surrogate::{acquire_surrogate, split_trajectories, SurrogateMode};
use crate::worker::{
    EvalContext, EvalRequest, EvalWorker, InProcessWorker, IsolatedObjective, ProcessWorker,
    ThreadWorker, WorkerLimits,
};

// ---- Supervisor ----

/// Process-wide runtime settings applied once before the first worker is
/// spawned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Size of the global rayon pool; `None` keeps rayon's default.
    pub num_threads: Option<usize>,
    /// Install a `tracing` fmt subscriber.
    pub install_tracing: bool,
    /// Filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            num_threads: None,
            install_tracing: false,
            log_filter: "info".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn with_num_threads(mut self, threads: usize) -> Self {
        self.num_threads = Some(threads);
        self
    }

    pub fn with_tracing(mut self, filter: impl Into<String>) -> Self {
        self.install_tracing = true;
        self.log_filter = filter.into();
        self
    }

    pub fn validate(&self) -> CtResult<()> {
        if self.num_threads == Some(0) {
            return Err(config_error!("num_threads must be at least 1"));
        }
        Ok(())
    }
}

static SUPERVISOR_INIT: Once = Once::new();

/// Apply `config` to the process. Only the first call has an effect.
pub fn init_supervisor(config: &SupervisorConfig) -> CtResult<()> {
    config.validate()?;
    SUPERVISOR_INIT.call_once(|| {
        if config.install_tracing {
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
            if tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init()
                .is_err()
            {
                debug!("Keeping the already installed tracing subscriber");
            }
        }
        if let Some(threads) = config.num_threads {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build_global()
            {
                Ok(()) => info!("Global rayon pool sized to {} threads", threads),
                Err(e) => warn!("Keeping existing rayon pool: {}", e),
            }
        }
    });
    Ok(())
}

// ---- Settings ----

/// Where configuration evaluations run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Isolation {
    /// On the calling thread; failures are not contained.
    InProcess,
    /// On a dedicated thread per evaluation. Contains panics and timeouts,
    /// but an abort or out-of-memory kill still takes the tuner down, and a
    /// timed-out thread keeps running until the process exits.
    #[default]
    Thread,
    /// In a child process built around [`crate::worker::run_worker`], such
    /// as `ct-worker`. Contains every failure of the evaluation.
    Process {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerSettings {
    pub isolation: Isolation,
    pub limits: WorkerLimits,
    /// Overrides the scenario's derived initial design size.
    pub initial_design_size: Option<usize>,
    pub supervisor: SupervisorConfig,
}

impl TunerSettings {
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_limits(mut self, limits: WorkerLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_initial_design_size(mut self, size: usize) -> Self {
        self.initial_design_size = Some(size);
        self
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn from_json_str(json: &str) -> CtResult<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> CtResult<Self> {
        let settings: Self = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> CtResult<()> {
        self.limits.validate()?;
        self.supervisor.validate()?;
        if self.initial_design_size == Some(0) {
            return Err(config_error!("initial_design_size must be at least 1"));
        }
        if let Isolation::Process { program, .. } = &self.isolation {
            if program.as_os_str().is_empty() {
                return Err(config_error!("process isolation needs a worker program"));
            }
        }
        Ok(())
    }
}

/// Per-run inputs of [`PipelineTuner::run`].
#[derive(Clone)]
pub struct RunOptions {
    /// Pretrained surrogate; skips the trajectory split and acquisition.
    pub surrogate: Option<Arc<dyn Model>>,
    /// Ground-truth dynamics for diagnostic costs.
    pub truedyn: Option<Arc<dyn Dynamics>>,
    pub surrogate_tune_iters: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            surrogate: None,
            truedyn: None,
            surrogate_tune_iters: 100,
        }
    }
}

impl RunOptions {
    pub fn with_surrogate(mut self, surrogate: Arc<dyn Model>) -> Self {
        self.surrogate = Some(surrogate);
        self
    }

    pub fn with_truedyn(mut self, truedyn: Arc<dyn Dynamics>) -> Self {
        self.truedyn = Some(truedyn);
        self
    }

    pub fn with_surrogate_tune_iters(mut self, iters: usize) -> Self {
        self.surrogate_tune_iters = iters;
        self
    }
}

// ---- Result ----

/// Full history of a pipeline tuning run, in evaluation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningResult {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub inc_cfg: Configuration,
    pub cfgs: Vec<Configuration>,
    #[serde(with = "ct_types::float_serde::vec")]
    pub costs: Vec<f64>,
    /// `None` until the first evaluation that carried info.
    pub inc_cfgs: Vec<Option<Configuration>>,
    #[serde(with = "ct_types::float_serde::vec")]
    pub inc_costs: Vec<f64>,
    pub surr_trajs: Vec<Option<Trajectory>>,
    #[serde(with = "ct_types::float_serde::option_vec")]
    pub truedyn_costs: Vec<Option<f64>>,
    #[serde(with = "ct_types::float_serde::option_vec")]
    pub inc_truedyn_costs: Vec<Option<f64>>,
    pub truedyn_trajs: Vec<Option<Trajectory>>,
    pub surr_tune_result: Option<ModelTuneResult>,
}

impl TuningResult {
    /// Fold a run history into a result. Only runs that carried info can
    /// become the incumbent, and only with a strictly lower cost. When none
    /// qualifies, `fallback` (the optimizer's own incumbent) is used.
    pub fn from_history(
        history: &RunHistory<EvalInfo>,
        system: &System,
        fallback: Option<&Configuration>,
        surr_tune_result: Option<ModelTuneResult>,
        started_at: DateTime<Utc>,
    ) -> CtResult<Self> {
        let n = history.len();
        let mut cfgs = Vec::with_capacity(n);
        let mut costs = Vec::with_capacity(n);
        let mut inc_cfgs = Vec::with_capacity(n);
        let mut inc_costs = Vec::with_capacity(n);
        let mut surr_trajs = Vec::with_capacity(n);
        let mut truedyn_costs = Vec::with_capacity(n);
        let mut inc_truedyn_costs = Vec::with_capacity(n);
        let mut truedyn_trajs = Vec::with_capacity(n);

        let mut inc_cfg: Option<Configuration> = None;
        let mut inc_cost = f64::INFINITY;
        let mut inc_truedyn_cost: Option<f64> = None;

        for record in history.records() {
            cfgs.push(record.configuration.clone());
            costs.push(record.cost);
            match &record.additional_info {
                Some(info) => {
                    if record.cost < inc_cost {
                        inc_cost = record.cost;
                        inc_cfg = Some(record.configuration.clone());
                        inc_truedyn_cost = info.truedyn_cost;
                    }
                    surr_trajs.push(
                        info.surr_traj
                            .as_ref()
                            .map(|data| data.to_trajectory(system))
                            .transpose()?,
                    );
                    truedyn_costs.push(info.truedyn_cost);
                    truedyn_trajs.push(
                        info.truedyn_traj
                            .as_ref()
                            .map(|data| data.to_trajectory(system))
                            .transpose()?,
                    );
                }
                None => {
                    surr_trajs.push(None);
                    truedyn_costs.push(None);
                    truedyn_trajs.push(None);
                }
            }
            inc_cfgs.push(inc_cfg.clone());
            inc_costs.push(inc_cost);
            inc_truedyn_costs.push(inc_truedyn_cost);
        }

        let inc_cfg = inc_cfg
            .or_else(|| fallback.cloned())
            .ok_or(SearchError::Exhausted { runs: n })?;

        Ok(Self {
            id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            inc_cfg,
            cfgs,
            costs,
            inc_cfgs,
            inc_costs,
            surr_trajs,
            truedyn_costs,
            inc_truedyn_costs,
            truedyn_trajs,
            surr_tune_result,
        })
    }

    pub fn len(&self) -> usize {
        self.cfgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cfgs.is_empty()
    }

    /// Final incumbent cost, `+inf` when no run carried info.
    pub fn inc_cost(&self) -> f64 {
        self.inc_costs.last().copied().unwrap_or(f64::INFINITY)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> CtResult<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn read_json(path: impl AsRef<Path>) -> CtResult<Self> {
        Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
    }
}

// ---- Orchestrator ----

/// Tunes the hyperparameters of a SysID+MPC pipeline against a surrogate.
#[derive(Debug)]
pub struct PipelineTuner {
    mode: SurrogateMode,
    settings: TunerSettings,
}

impl PipelineTuner {
    pub fn new(mode: SurrogateMode) -> CtResult<Self> {
        mode.validate()?;
        Ok(Self {
            mode,
            settings: TunerSettings::default(),
        })
    }

    pub fn with_settings(mut self, settings: TunerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn mode(&self) -> &SurrogateMode {
        &self.mode
    }

    pub fn settings(&self) -> &TunerSettings {
        &self.settings
    }

    /// Run `n_iters` pipeline evaluations and return the controller built
    /// from the incumbent configuration.
    pub fn run(
        &self,
        pipeline: Arc<dyn Pipeline>,
        task: &Task,
        trajs: &[Trajectory],
        n_iters: usize,
        rng: &mut dyn RngCore,
        options: RunOptions,
    ) -> CtResult<(Box<dyn Controller>, TuningResult)> {
        let started_at = Utc::now();
        self.settings.validate()?;
        init_supervisor(&self.settings.supervisor)?;
        self.mode.validate()?;

        let space = pipeline.configuration_space();
        space.validate()?;
        if n_iters == 0 {
            return Err(config_error!("n_iters must be at least 1"));
        }

        let (surrogate, sysid_trajs, surr_tune_result) = match options.surrogate {
            Some(surrogate) => {
                info!("Using supplied {} surrogate", surrogate.name());
                (surrogate, trajs.to_vec(), None)
            }
            None => {
                let split = self.mode.split().ok_or_else(|| {
                    config_error!("{} mode needs a surrogate supplied to run", self.mode.name())
                })?;
                let (surr_trajs, sysid_trajs) = split_trajectories(trajs, split, rng);
                info!(
                    "Split {} trajectories: {} surrogate, {} sysid",
                    trajs.len(),
                    surr_trajs.len(),
                    sysid_trajs.len()
                );
                let (surrogate, tune_result) = acquire_surrogate(
                    &self.mode,
                    pipeline.system(),
                    &surr_trajs,
                    rng,
                    options.surrogate_tune_iters,
                )?;
                (surrogate, sysid_trajs, tune_result)
            }
        };

        let mut evaluator = ConfigEvaluator::new(
            Arc::clone(&pipeline),
            task.clone(),
            surrogate,
            sysid_trajs.clone(),
        );
        if let Some(truedyn) = options.truedyn {
            evaluator = evaluator.with_truedyn(truedyn);
        }
        let evaluator = Arc::new(evaluator);
        let worker = self.worker(&evaluator)?;

        let sanity_cfg = pipeline.sanity_configuration();
        info!("Sanity evaluation of {} on {} worker", sanity_cfg, worker.name());
        match worker.evaluate(EvalRequest::sanity(sanity_cfg)) {
            Ok(response) => match &response.rejection {
                Some(reason) => warn!("Sanity evaluation rejected: {}", reason),
                None => info!("Sanity evaluation cost {:.6}", response.cost),
            },
            Err(e) => warn!("Sanity evaluation failed: {}", e),
        }

        let seed = rng.gen_range(0..1u64 << 31);
        let scenario = Scenario::new("pipeline-tuning")
            .with_runcount_limit(n_iters)
            .with_deterministic(true)
            .with_abort_on_first_run_crash(false)
            .with_initial_design(InitialDesign::LatinHypercube, self.settings.initial_design_size);

        let mut smbo = Smbo::<EvalInfo>::new(space, scenario, seed)?;
        let objective = IsolatedObjective::new(worker.as_ref());
        let fallback = match smbo.optimize(&objective) {
            Ok(cfg) => Some(cfg),
            Err(CtError::Search(SearchError::Exhausted { runs })) => {
                warn!("Search found no incumbent after {} runs", runs);
                None
            }
            Err(e) => return Err(e),
        };

        let result = TuningResult::from_history(
            smbo.run_history(),
            pipeline.system(),
            fallback.as_ref(),
            surr_tune_result,
            started_at,
        )?;
        info!(
            "Tuning finished after {} runs: incumbent {} cost {:.6}",
            result.len(),
            result.inc_cfg,
            result.inc_cost()
        );

        let output = pipeline.build(&result.inc_cfg, task, &sysid_trajs, None)?;
        Ok((output.controller, result))
    }

    fn worker(&self, evaluator: &Arc<ConfigEvaluator>) -> CtResult<Box<dyn EvalWorker>> {
        let limits = self.settings.limits.clone();
        Ok(match &self.settings.isolation {
            Isolation::InProcess => Box::new(InProcessWorker::new(Arc::clone(evaluator))),
            Isolation::Thread => Box::new(ThreadWorker::new(Arc::clone(evaluator), limits)),
            Isolation::Process { program, args } => {
                let context = EvalContext::from_evaluator(evaluator)?;
                Box::new(ProcessWorker::new(program.clone(), context, limits).with_args(args.clone()))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ct_optimizer::{RunRecord, RunStatus};

    fn system() -> System {
        System::new(["x"], ["u"])
    }

    fn cfg(gain: f64) -> Configuration {
        Configuration::new().with("gain", gain)
    }

    fn info(cost: f64) -> EvalInfo {
        EvalInfo {
            surr_cost: cost,
            surr_traj: None,
            surr_rejection: None,
            truedyn_cost: None,
            truedyn_traj: None,
        }
    }

    fn history(entries: &[(f64, RunStatus, bool)]) -> RunHistory<EvalInfo> {
        let mut history = RunHistory::new();
        for (i, &(cost, status, with_info)) in entries.iter().enumerate() {
            history.push(RunRecord {
                id: Uuid::new_v4(),
                trial_number: i,
                configuration: cfg(i as f64),
                cost,
                status,
                additional_info: with_info.then(|| info(cost)),
                error: None,
                started_at: Utc::now(),
                finished_at: Utc::now(),
            });
        }
        history
    }

    #[test]
    fn incumbent_is_running_minimum() {
        let history = history(&[
            (5.0, RunStatus::Success, true),
            (2.0, RunStatus::Success, true),
            (8.0, RunStatus::Success, true),
        ]);
        let result = TuningResult::from_history(&history, &system(), None, None, Utc::now()).unwrap();

        assert_eq!(result.costs, vec![5.0, 2.0, 8.0]);
        assert_eq!(result.inc_costs, vec![5.0, 2.0, 2.0]);
        assert_eq!(result.inc_cfgs[2], Some(result.cfgs[1].clone()));
        assert_eq!(result.inc_cfg, cfg(1.0));
    }

    #[test]
    fn ties_keep_earliest() {
        let history = history(&[
            (3.0, RunStatus::Success, true),
            (3.0, RunStatus::Success, true),
        ]);
        let result = TuningResult::from_history(&history, &system(), None, None, Utc::now()).unwrap();
        assert_eq!(result.inc_cfgs[1], Some(cfg(0.0)));
    }

    #[test]
    fn crashed_runs_are_recorded_but_never_incumbent() {
        let history = history(&[
            (4.0, RunStatus::Success, true),
            (f64::INFINITY, RunStatus::Crashed, false),
            (3.0, RunStatus::Success, true),
            (7.0, RunStatus::Success, true),
            (1.0, RunStatus::Success, true),
        ]);
        let result = TuningResult::from_history(&history, &system(), None, None, Utc::now()).unwrap();

        assert_eq!(result.len(), 5);
        assert_eq!(result.costs[1], f64::INFINITY);
        assert!(result.surr_trajs[1].is_none());
        assert!(result.truedyn_costs[1].is_none());
        assert_eq!(result.inc_cfgs[1], Some(cfg(0.0)));
        assert_eq!(result.inc_costs, vec![4.0, 4.0, 3.0, 3.0, 1.0]);
    }

    #[test]
    fn leading_runs_without_info_have_no_incumbent() {
        let history = history(&[
            (f64::INFINITY, RunStatus::Crashed, false),
            (6.0, RunStatus::Success, true),
        ]);
        let result = TuningResult::from_history(&history, &system(), None, None, Utc::now()).unwrap();
        assert_eq!(result.inc_cfgs, vec![None, Some(cfg(1.0))]);
        assert_eq!(result.inc_costs[0], f64::INFINITY);
    }

    #[test]
    fn no_incumbent_uses_fallback_or_fails() {
        let history = history(&[(f64::INFINITY, RunStatus::Crashed, false)]);
        let fallback = cfg(9.0);
        let result =
            TuningResult::from_history(&history, &system(), Some(&fallback), None, Utc::now())
                .unwrap();
        assert_eq!(result.inc_cfg, fallback);

        let err = TuningResult::from_history(&history, &system(), None, None, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            CtError::Search(SearchError::Exhausted { runs: 1 })
        ));

        let empty = RunHistory::<EvalInfo>::new();
        assert!(TuningResult::from_history(&empty, &system(), None, None, Utc::now()).is_err());
    }

    #[test]
    fn settings_load_from_json() {
        let settings = TunerSettings::from_json_str(
            r#"{
                "isolation": {"kind": "process", "program": "/usr/bin/ct-worker"},
                "limits": {"wall_time_secs": 30.0},
                "initial_design_size": 4,
                "supervisor": {"num_threads": 2}
            }"#,
        )
        .unwrap();
        assert_eq!(
            settings.isolation,
            Isolation::Process {
                program: PathBuf::from("/usr/bin/ct-worker"),
                args: Vec::new(),
            }
        );
        assert_eq!(settings.limits.wall_time_secs, 30.0);
        assert_eq!(settings.limits.grace_period_secs, 10.0);
        assert_eq!(settings.initial_design_size, Some(4));
        assert_eq!(settings.supervisor.num_threads, Some(2));
        assert!(!settings.supervisor.install_tracing);

        let defaults = TunerSettings::from_json_str("{}").unwrap();
        assert_eq!(defaults, TunerSettings::default());
        assert_eq!(defaults.isolation, Isolation::Thread);

        assert!(TunerSettings::from_json_str(r#"{"initial_design_size": 0}"#).is_err());
        assert!(TunerSettings::from_json_str(r#"{"supervisor": {"num_threads": 0}}"#).is_err());
    }

    #[test]
    fn run_options_default_tune_iters() {
        let options = RunOptions::default();
        assert_eq!(options.surrogate_tune_iters, 100);
        assert!(options.surrogate.is_none());
        assert!(options.truedyn.is_none());
    }
}
