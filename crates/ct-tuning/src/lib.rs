//! # ct-tuning
//!
//! Hyperparameter tuning of SysID+MPC pipelines against a surrogate model.
//!
//! A surrogate is acquired from part of the trajectory data (default or fixed
//! configuration, tuned, auto-selected across model families, or supplied
//! pretrained). Each candidate pipeline configuration is then built on the
//! remaining data and scored by closed-loop simulation against the surrogate,
//! inside an isolated worker, while the SMBO search from `ct-optimizer`
//! proposes the next configuration. A bootstrap ensemble evaluator turns a
//! single surrogate cost into a cost distribution.
//!
//! Process isolation runs each evaluation in a worker binary built around
//! [`run_worker`]; `ct-worker` is one for the scalar problem in
//! [`reference`].

pub mod bootstrap;
pub mod evaluator;
pub mod model_tuner;
pub mod reference;
pub mod surrogate;
pub mod tuner;
pub mod worker;

pub use bootstrap::{bootstrap_sample, BootstrapEvaluator, BootstrapInfo, BootstrapJobResult};
pub use evaluator::{ConfigEvaluator, EvalInfo, EvalResponse, RejectionReason};
pub use model_tuner::{
    HoldoutModelEvaluator, ModelEvaluator, ModelMetric, ModelTuneResult, ModelTuner,
    SearchModelTuner, MODEL_PARAMETER,
};
pub use surrogate::{
    acquire_surrogate, split_trajectories, FactoryCatalog, SurrogateMode, SurrogateTuning,
};
pub use tuner::{
    init_supervisor, Isolation, PipelineTuner, RunOptions, SupervisorConfig, TunerSettings,
    TuningResult,
};
pub use worker::{
    run_worker, serve, EvalContext, EvalRequest, EvalWorker, InProcessWorker,
    IsolatedObjective, ProcessWorker, ThreadWorker, WorkerJob, WorkerLimits, WorkerSetup,
    SANITY_TRIAL,
};
