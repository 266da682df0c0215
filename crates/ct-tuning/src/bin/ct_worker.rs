//! Process worker for the scalar reference problem.
//!
//! Reads one job per stdin line and answers on stdout; logs go to stderr.
//!
//! ```text
//! ct-worker [--max-gain GAIN] [--abort-above GAIN]
//! ```
//!
//! `--abort-above` aborts the process while building any configuration with
//! a larger gain, which exercises crash containment in the tuner.

use std::process;
use std::sync::Arc;

use ct_tuning::reference::{GainPipeline, LeastSquaresFactory, LinearPlant, QuadraticCost};
use ct_tuning::{run_worker, WorkerSetup};
use ct_types::{
    config_error, Configuration, ConfigurationSpace, CtResult, Model, Pipeline, PipelineError,
    PipelineOutput, System, Task, Trajectory,
};
use tracing::error;
use tracing_subscriber::EnvFilter;

struct AbortAbove {
    inner: GainPipeline,
    limit: Option<f64>,
}

impl Pipeline for AbortAbove {
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
        if let (Some(limit), Some(gain)) = (self.limit, cfg.get_f64("gain")) {
            if gain > limit {
                error!("Aborting on gain {} above {}", gain, limit);
                process::abort();
            }
        }
        self.inner.build(cfg, task, trajs, model)
    }
}

fn gain_arg(flag: &str, value: Option<String>) -> CtResult<f64> {
    let value = value.ok_or_else(|| config_error!("{} needs a value", flag))?;
    value
        .parse()
        .map_err(|_| config_error!("{} expects a number, got {:?}", flag, value))
}

fn main() -> CtResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut pipeline = GainPipeline::new();
    let mut abort_above = None;
    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--max-gain" => pipeline = pipeline.with_max_gain(gain_arg(&flag, args.next())?),
            "--abort-above" => abort_above = Some(gain_arg(&flag, args.next())?),
            other => return Err(config_error!("unknown argument {:?}", other)),
        }
    }

    let setup = WorkerSetup::new(
        Arc::new(AbortAbove {
            inner: pipeline,
            limit: abort_above,
        }),
        Arc::new(QuadraticCost::default()),
        Arc::new(LeastSquaresFactory::new()),
    )
    .with_truedyn(Arc::new(LinearPlant::REFERENCE));

    run_worker(&setup)?;
    Ok(())
}
