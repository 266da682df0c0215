//! Dynamics model and model factory interfaces.
//!
//! Concrete model families live outside this workspace; the tuner only needs
//! to build, train, clone and query them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::{ModelError, SimulationError};
use crate::space::{Configuration, ConfigurationSpace};
use crate::trajectory::{System, Trajectory};

/// A learned proxy for the system dynamics.
pub trait Model: Send + Sync {
    /// Name of the model family (e.g. "ARX").
    fn name(&self) -> &str;

    /// Hyperparameters the model was created with.
    fn configuration(&self) -> &Configuration;

    fn system(&self) -> &System;

    fn is_trained(&self) -> bool;

    /// Fit the model to `trajs`, replacing any previous fit.
    fn train(&mut self, trajs: &[Trajectory]) -> Result<(), ModelError>;

    /// An untrained copy with identical hyperparameters.
    fn clone_untrained(&self) -> Box<dyn Model>;

    /// Predict the next observation from the current one and a control.
    fn pred(&self, obs: &[f64], ctrl: &[f64]) -> Result<Vec<f64>, SimulationError>;

    /// By-value form of the trained model for transfer to another process.
    fn snapshot(&self) -> Result<ModelSnapshot, ModelError> {
        Err(ModelError::SnapshotUnsupported {
            name: self.name().to_string(),
        })
    }
}

/// Serialized model parameters, restorable by the factory that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub name: String,
    pub configuration: Configuration,
    pub state: serde_json::Value,
}

/// Creates trained models of one family from a configuration.
pub trait ModelFactory: Send + Sync {
    fn name(&self) -> &str;

    fn system(&self) -> &System;

    fn configuration_space(&self) -> ConfigurationSpace;

    /// Instantiate `cfg` and train it on `trajs`.
    fn build(&self, cfg: &Configuration, trajs: &[Trajectory]) -> Result<Box<dyn Model>, ModelError>;

    /// Recreate a trained model from [`Model::snapshot`] output.
    fn restore(&self, snapshot: &ModelSnapshot) -> Result<Box<dyn Model>, ModelError> {
        Err(ModelError::SnapshotUnsupported {
            name: snapshot.name.clone(),
        })
    }
}

/// Shared handle to a factory.
pub type SharedFactory = Arc<dyn ModelFactory>;

/// The model families searched jointly when the surrogate is auto-selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelFamily {
    Arx,
    Mlp,
    Sindy,
    ApproxGp,
    Koopman,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 5] = [
        ModelFamily::Mlp,
        ModelFamily::Sindy,
        ModelFamily::ApproxGp,
        ModelFamily::Arx,
        ModelFamily::Koopman,
    ];

    /// Label used as the categorical value in joint search spaces.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Arx => "ARX",
            Self::Mlp => "MLP",
            Self::Sindy => "SINDy",
            Self::ApproxGp => "ApproxGP",
            Self::Koopman => "Koopman",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.label() == label)
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_labels_are_unique_and_round_trip() {
        let mut labels: Vec<_> = ModelFamily::ALL.iter().map(|f| f.label()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), 5);

        for family in ModelFamily::ALL {
            assert_eq!(ModelFamily::from_label(family.label()), Some(family));
        }
        assert_eq!(ModelFamily::from_label("LSTM"), None);
    }
}
