//! # ct-optimizer
//!
//! Black-box configuration search for pipeline and model tuning.
//!
//! Provides search strategies over a [`ct_types::ConfigurationSpace`]
//! (Latin-hypercube initial design, random search, and a local-perturbation
//! Bayesian-style search), search scenarios, run history tracking, and the
//! sequential model-based optimization loop that drives them.

mod history;
mod scenario;
mod search;
mod smbo;

pub use history::{RunHistory, RunRecord, RunStatus};
pub use scenario::{
    InitialDesign, ObjectiveDirection, Scenario, ScenarioId, SearchState, SearchStatus,
};
pub use search::{BayesianSearch, LatinHypercube, RandomSearch, SearchStrategy};
pub use smbo::{Objective, Smbo, TrialOutcome};
