//! Distributions over a cost estimate.

use serde::{Deserialize, Serialize};

/// Standard deviations at or below this are treated as zero.
pub const ZERO_STD_TOLERANCE: f64 = 1e-8;

/// Uncertainty about a scalar cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostDistribution {
    Normal {
        #[serde(with = "crate::float_serde")]
        mean: f64,
        std: f64,
    },
    Constant {
        #[serde(with = "crate::float_serde")]
        value: f64,
    },
}

impl CostDistribution {
    /// Population mean and standard deviation of `samples`, collapsed to the
    /// constant form when the spread is numerically zero. Any non-finite
    /// sample yields `Constant(+inf)`. Returns `None` for no samples.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        if samples.iter().any(|c| !c.is_finite()) {
            return Some(Self::Constant {
                value: f64::INFINITY,
            });
        }

        // Summation order is fixed so the result does not depend on the
        // order the samples arrived in.
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let var = sorted.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
        let std = var.sqrt();

        if std <= ZERO_STD_TOLERANCE {
            Some(Self::Constant { value: mean })
        } else {
            Some(Self::Normal { mean, std })
        }
    }

    pub fn mean(&self) -> f64 {
        match self {
            Self::Normal { mean, .. } => *mean,
            Self::Constant { value } => *value,
        }
    }

    pub fn std(&self) -> f64 {
        match self {
            Self::Normal { std, .. } => *std,
            Self::Constant { .. } => 0.0,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant { .. })
    }
}
