//! Isolated execution of configuration evaluations.
//!
//! Each evaluation runs behind an [`EvalWorker`]. Crashes, panics and hangs
//! inside a worker surface as [`WorkerError`]s at this boundary and are
//! recorded by the search as crashed runs instead of aborting it. Requests
//! and responses cross the boundary by value: over a crossbeam channel for
//! [`ThreadWorker`], as JSON lines over stdio for [`ProcessWorker`].

use std::any::Any;
use std::cell::Cell;
use std::io::{self, BufRead, BufReader, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use ct_optimizer::{Objective, TrialOutcome};
use ct_types::{
    config_error, Configuration, CostFunction, CtError, CtResult, Dynamics, ModelFactory,
    ModelSnapshot, Pipeline, SimulationError, System, Task, TaskSettings, TermCond, Trajectory,
    TrajectoryData, WorkerError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::evaluator::{ConfigEvaluator, EvalInfo, EvalResponse, RejectionReason};

/// Trial number reserved for the evaluation that precedes a search.
pub const SANITY_TRIAL: usize = usize::MAX;

/// One configuration to evaluate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRequest {
    pub trial: usize,
    pub configuration: Configuration,
}

impl EvalRequest {
    pub fn sanity(configuration: Configuration) -> Self {
        Self {
            trial: SANITY_TRIAL,
            configuration,
        }
    }

    pub fn is_sanity(&self) -> bool {
        self.trial == SANITY_TRIAL
    }

    /// Tag used in log lines and thread names.
    pub fn label(&self) -> String {
        if self.is_sanity() {
            "sanity".to_string()
        } else {
            format!("trial-{}", self.trial)
        }
    }
}

/// Wall-clock budget for a single evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerLimits {
    /// Seconds an evaluation may run.
    pub wall_time_secs: f64,
    /// Extra seconds allowed before the worker is abandoned.
    pub grace_period_secs: f64,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            wall_time_secs: 300.0,
            grace_period_secs: 10.0,
        }
    }
}

impl WorkerLimits {
    pub fn new(wall_time_secs: f64) -> Self {
        Self {
            wall_time_secs,
            ..Self::default()
        }
    }

    pub fn with_wall_time(mut self, secs: f64) -> Self {
        self.wall_time_secs = secs;
        self
    }

    pub fn with_grace_period(mut self, secs: f64) -> Self {
        self.grace_period_secs = secs;
        self
    }

    pub fn validate(&self) -> CtResult<()> {
        if self.wall_time_secs.is_nan() || self.wall_time_secs <= 0.0 {
            return Err(ct_types::config_error!(
                "wall_time_secs must be positive, got {}",
                self.wall_time_secs
            ));
        }
        if self.grace_period_secs.is_nan() || self.grace_period_secs < 0.0 {
            return Err(ct_types::config_error!(
                "grace_period_secs must be non-negative, got {}",
                self.grace_period_secs
            ));
        }
        Ok(())
    }

    /// Total time to wait for a reply.
    pub fn deadline(&self) -> Duration {
        let secs = (self.wall_time_secs + self.grace_period_secs).max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    fn timeout_error(&self) -> WorkerError {
        WorkerError::Timeout {
            seconds: self.wall_time_secs + self.grace_period_secs,
        }
    }
}

/// Runs evaluation requests and reports worker-level faults.
pub trait EvalWorker: Send + Sync {
    fn evaluate(&self, request: EvalRequest) -> Result<EvalResponse, WorkerError>;

    fn name(&self) -> &str;
}

// ---- In-process ----

/// Calls the evaluator directly on the caller's thread. Panics propagate.
pub struct InProcessWorker {
    evaluator: Arc<ConfigEvaluator>,
}

impl InProcessWorker {
    pub fn new(evaluator: Arc<ConfigEvaluator>) -> Self {
        Self { evaluator }
    }
}

impl EvalWorker for InProcessWorker {
    fn evaluate(&self, request: EvalRequest) -> Result<EvalResponse, WorkerError> {
        Ok(EvalResponse::from_outcome(
            self.evaluator.evaluate(&request.configuration),
        ))
    }

    fn name(&self) -> &str {
        "in_process"
    }
}

// ---- Dedicated thread ----

/// Runs each request on a fresh OS thread, capturing panics and enforcing
/// the wall-clock limit. A timed-out thread is detached and left to finish
/// on its own; aborts are not contained. Use [`ProcessWorker`] for those.
pub struct ThreadWorker {
    evaluator: Arc<ConfigEvaluator>,
    limits: WorkerLimits,
}

impl ThreadWorker {
    pub fn new(evaluator: Arc<ConfigEvaluator>, limits: WorkerLimits) -> Self {
        Self { evaluator, limits }
    }

    pub fn limits(&self) -> &WorkerLimits {
        &self.limits
    }
}

impl EvalWorker for ThreadWorker {
    fn evaluate(&self, request: EvalRequest) -> Result<EvalResponse, WorkerError> {
        let (tx, rx) = crossbeam_channel::bounded::<Result<EvalResponse, String>>(1);
        let evaluator = Arc::clone(&self.evaluator);
        let label = request.label();

        let handle = thread::Builder::new()
            .name(format!("eval-worker-{label}"))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    evaluator.evaluate(&request.configuration)
                }));
                let reply = outcome
                    .map(EvalResponse::from_outcome)
                    .map_err(panic_message);
                let _ = tx.send(reply);
            })
            .map_err(|e| WorkerError::Spawn {
                message: e.to_string(),
            })?;

        match rx.recv_timeout(self.limits.deadline()) {
            Ok(reply) => {
                let _ = handle.join();
                reply.map_err(|message| {
                    warn!("{} worker panicked: {}", label, message);
                    WorkerError::Crashed { message }
                })
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{} exceeded {:.1}s; abandoning worker thread",
                    label,
                    self.limits.wall_time_secs + self.limits.grace_period_secs
                );
                Err(self.limits.timeout_error())
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                Err(WorkerError::Crashed {
                    message: "worker thread exited without a reply".to_string(),
                })
            }
        }
    }

    fn name(&self) -> &str {
        "thread"
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

// ---- Child process ----

/// Everything a child process needs to rebuild the evaluator, apart from
/// code: the pipeline, the cost, the surrogate's factory and the true
/// dynamics come from the worker's own [`WorkerSetup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalContext {
    pub system: System,
    pub task: TaskSettings,
    pub sysid_trajs: Vec<TrajectoryData>,
    pub surrogate: ModelSnapshot,
    /// Whether the parent evaluates against true dynamics too.
    #[serde(default)]
    pub truedyn: bool,
}

impl EvalContext {
    /// Capture the evaluator's task, sysid data and a snapshot of its
    /// surrogate.
    pub fn from_evaluator(evaluator: &ConfigEvaluator) -> CtResult<Self> {
        Ok(Self {
            system: evaluator.task().system().clone(),
            task: evaluator.task().settings(),
            sysid_trajs: evaluator
                .sysid_trajs()
                .iter()
                .map(TrajectoryData::from)
                .collect(),
            surrogate: evaluator.surrogate().snapshot()?,
            truedyn: evaluator.truedyn().is_some(),
        })
    }

    pub fn sysid_trajectories(&self) -> Result<Vec<Trajectory>, SimulationError> {
        self.sysid_trajs
            .iter()
            .map(|data| data.to_trajectory(&self.system))
            .collect()
    }
}

/// The code half of a worker process. Combined with an [`EvalContext`] it
/// reproduces the parent's [`ConfigEvaluator`].
pub struct WorkerSetup {
    pipeline: Arc<dyn Pipeline>,
    cost: Arc<dyn CostFunction>,
    factory: Arc<dyn ModelFactory>,
    term_cond: Option<TermCond>,
    truedyn: Option<Arc<dyn Dynamics>>,
}

impl WorkerSetup {
    pub fn new(
        pipeline: Arc<dyn Pipeline>,
        cost: Arc<dyn CostFunction>,
        factory: Arc<dyn ModelFactory>,
    ) -> Self {
        Self {
            pipeline,
            cost,
            factory,
            term_cond: None,
            truedyn: None,
        }
    }

    pub fn with_term_cond(mut self, term_cond: TermCond) -> Self {
        self.term_cond = Some(term_cond);
        self
    }

    /// Dynamics used when a context asks for true-dynamics diagnostics.
    pub fn with_truedyn(mut self, truedyn: Arc<dyn Dynamics>) -> Self {
        self.truedyn = Some(truedyn);
        self
    }

    /// Rebuild the evaluator described by `context`. A context that asks for
    /// true dynamics is an error when this setup has none.
    pub fn evaluator(&self, context: &EvalContext) -> CtResult<ConfigEvaluator> {
        if self.pipeline.system() != &context.system {
            return Err(config_error!(
                "worker pipeline system {:?} does not match the tuner's {:?}",
                self.pipeline.system(),
                context.system
            ));
        }
        let surrogate = self.factory.restore(&context.surrogate)?;
        let mut task = Task::from_settings(
            context.system.clone(),
            context.task.clone(),
            Arc::clone(&self.cost),
        );
        if let Some(term_cond) = &self.term_cond {
            task = task.with_term_cond(Arc::clone(term_cond));
        }

        let evaluator = ConfigEvaluator::new(
            Arc::clone(&self.pipeline),
            task,
            Arc::from(surrogate),
            context.sysid_trajectories()?,
        );
        match (&self.truedyn, context.truedyn) {
            (Some(truedyn), true) => Ok(evaluator.with_truedyn(Arc::clone(truedyn))),
            (None, true) => Err(config_error!(
                "tuner requested true dynamics but this worker has none"
            )),
            (_, false) => Ok(evaluator),
        }
    }
}

/// One line on a worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub context: EvalContext,
    pub request: EvalRequest,
}

/// Spawns `program` per request. The child reads one [`WorkerJob`] line from
/// stdin and answers with one [`EvalResponse`] line on stdout; see [`serve`].
pub struct ProcessWorker {
    program: PathBuf,
    args: Vec<String>,
    context: EvalContext,
    limits: WorkerLimits,
}

impl ProcessWorker {
    pub fn new(program: impl Into<PathBuf>, context: EvalContext, limits: WorkerLimits) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            context,
            limits,
        }
    }

    pub fn with_args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn spawn(&self) -> Result<Child, WorkerError> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| WorkerError::Spawn {
                message: format!("{}: {}", self.program.display(), e),
            })
    }
}

impl EvalWorker for ProcessWorker {
    fn evaluate(&self, request: EvalRequest) -> Result<EvalResponse, WorkerError> {
        let label = request.label();
        let job = WorkerJob {
            context: self.context.clone(),
            request,
        };
        let line = serde_json::to_string(&job).map_err(|e| WorkerError::Protocol {
            message: e.to_string(),
        })?;

        let mut child = self.spawn()?;
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                reap(&mut child);
                return Err(WorkerError::Spawn {
                    message: "worker stdio was not captured".to_string(),
                });
            }
        };

        // Both pipe ends are serviced off this thread so a child that never
        // reads or never answers cannot block past the deadline.
        thread::spawn(move || {
            let mut stdin = stdin;
            let _ = writeln!(stdin, "{line}").and_then(|_| stdin.flush());
        });
        let (tx, rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let mut reply = String::new();
            let result = BufReader::new(stdout).read_line(&mut reply).map(|_| reply);
            let _ = tx.send(result);
        });

        match rx.recv_timeout(self.limits.deadline()) {
            Ok(Ok(reply)) if reply.trim().is_empty() => {
                let status = child.wait().map_err(|e| WorkerError::Crashed {
                    message: e.to_string(),
                })?;
                if status.success() {
                    Err(WorkerError::Protocol {
                        message: "worker closed stdout without replying".to_string(),
                    })
                } else {
                    warn!("{} worker process exited with {}", label, status);
                    Err(WorkerError::Crashed {
                        message: format!("worker exited with {status}"),
                    })
                }
            }
            Ok(Ok(reply)) => {
                reap(&mut child);
                debug!("{} worker replied with {} bytes", label, reply.len());
                serde_json::from_str(reply.trim()).map_err(|e| WorkerError::Protocol {
                    message: format!("malformed reply: {e}"),
                })
            }
            Ok(Err(e)) => {
                reap(&mut child);
                Err(WorkerError::Crashed {
                    message: e.to_string(),
                })
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("{} worker process timed out; killing it", label);
                reap(&mut child);
                Err(self.limits.timeout_error())
            }
            Err(RecvTimeoutError::Disconnected) => {
                reap(&mut child);
                Err(WorkerError::Crashed {
                    message: "reader thread exited without a reply".to_string(),
                })
            }
        }
    }

    fn name(&self) -> &str {
        "process"
    }
}

fn reap(child: &mut Child) {
    if !matches!(child.try_wait(), Ok(Some(_))) {
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Worker side of [`ProcessWorker`]: answer every job line on `input` with
/// one response line on `output`. `build` turns a job's context into an
/// evaluator. Returns the number of jobs served.
pub fn serve<R, W, F>(input: R, mut output: W, build: F) -> CtResult<usize>
where
    R: BufRead,
    W: Write,
    F: Fn(&EvalContext) -> CtResult<ConfigEvaluator>,
{
    let mut served = 0;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let job: WorkerJob = serde_json::from_str(&line)?;
        let evaluator = build(&job.context)?;
        let response = EvalResponse::from_outcome(evaluator.evaluate(&job.request.configuration));
        serde_json::to_writer(&mut output, &response)?;
        writeln!(output)?;
        output.flush()?;
        served += 1;
    }
    Ok(served)
}

/// Entry point for a worker binary: serve `setup` over stdin and stdout.
/// Logging must go to stderr, stdout carries the replies.
pub fn run_worker(setup: &WorkerSetup) -> CtResult<usize> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let served = serve(stdin.lock(), stdout.lock(), |context| setup.evaluator(context))?;
    info!("Worker served {} jobs", served);
    Ok(served)
}

// ---- Optimizer adapter ----

/// Presents a worker as an optimizer objective. Worker faults and evaluation
/// faults become crashed runs; rejections are successful runs at `+inf`
/// without info.
pub struct IsolatedObjective<'a> {
    worker: &'a dyn EvalWorker,
    next_trial: Cell<usize>,
}

impl<'a> IsolatedObjective<'a> {
    pub fn new(worker: &'a dyn EvalWorker) -> Self {
        Self {
            worker,
            next_trial: Cell::new(0),
        }
    }
}

impl Objective<EvalInfo> for IsolatedObjective<'_> {
    fn evaluate(&self, cfg: &Configuration) -> Result<TrialOutcome<EvalInfo>, CtError> {
        let trial = self.next_trial.get();
        self.next_trial.set(trial + 1);

        let response = self.worker.evaluate(EvalRequest {
            trial,
            configuration: cfg.clone(),
        })?;
        if let Some(RejectionReason::Fault { message }) = response.rejection {
            return Err(WorkerError::Crashed { message }.into());
        }
        Ok(TrialOutcome::new(response.cost, response.info))
    }
}
