use thiserror::Error;

/// Main error type for the tuning system
#[derive(Error, Debug)]
pub enum CtError {
    #[error("Configuration space error: {0}")]
    Space(#[from] SpaceError),

    #[error("Simulation error: {0}")]
    Simulation(#[from] SimulationError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Malformed configuration spaces and configurations that do not fit them
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpaceError {
    #[error("Configuration space has no parameters")]
    Empty,

    #[error("Duplicate parameter: {name}")]
    DuplicateParameter { name: String },

    #[error("Invalid range for {name}: {message}")]
    InvalidRange { name: String, message: String },

    #[error("Invalid default for {name}: {message}")]
    InvalidDefault { name: String, message: String },

    #[error("Condition on {name} references unknown or later parameter {parent}")]
    InvalidCondition { name: String, parent: String },

    #[error("Unknown parameter: {name}")]
    UnknownParameter { name: String },

    #[error("Missing active parameter: {name}")]
    MissingParameter { name: String },

    #[error("Parameter {name} is inactive but has a value")]
    InactiveParameter { name: String },

    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
}

/// Closed-loop simulation failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    #[error("Linear algebra failure: {message}")]
    LinAlg { message: String },

    #[error("Non-finite state at step {step}")]
    NonFinite { step: usize },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Controller failure: {message}")]
    Controller { message: String },
}

impl SimulationError {
    /// Numerically degenerate dynamics or solves. These reject a
    /// configuration instead of aborting the search.
    pub fn is_numerical(&self) -> bool {
        matches!(self, Self::LinAlg { .. } | Self::NonFinite { .. })
    }
}

/// Pipeline construction failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Incompatible controller/model combination: {message}")]
    Incompatible { message: String },

    #[error("System identification failed: {message}")]
    Sysid { message: String },

    #[error("Controller synthesis failed: {message}")]
    Synthesis { message: String },

    #[error("Invalid pipeline configuration: {0}")]
    Space(#[from] SpaceError),
}

/// Dynamics model failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Model training failed: {message}")]
    Training { message: String },

    #[error("Model is not trained")]
    NotTrained,

    #[error("Model {name} does not support snapshots")]
    SnapshotUnsupported { name: String },

    #[error("Snapshot mismatch: expected {expected}, got {actual}")]
    SnapshotMismatch { expected: String, actual: String },

    #[error("Invalid model configuration: {0}")]
    Space(#[from] SpaceError),
}

/// Faults of an isolated evaluation worker
#[derive(Error, Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum WorkerError {
    #[error("Worker timed out after {seconds:.1} seconds")]
    Timeout {
        #[serde(with = "crate::float_serde")]
        seconds: f64,
    },

    #[error("Worker crashed: {message}")]
    Crashed { message: String },

    #[error("Worker protocol error: {message}")]
    Protocol { message: String },

    #[error("Worker could not be spawned: {message}")]
    Spawn { message: String },
}

/// Optimizer-level failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    #[error("Search produced no usable incumbent after {runs} runs")]
    Exhausted { runs: usize },

    #[error("First run crashed and the scenario aborts on first crash: {message}")]
    FirstRunCrashed { message: String },

    #[error("Invalid scenario: {message}")]
    InvalidScenario { message: String },
}

/// Result type alias for tuning operations
pub type CtResult<T> = Result<T, CtError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::errors::CtError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::errors::CtError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::errors::CtError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SpaceError::InvalidRange {
            name: "horizon".to_string(),
            message: "low 10 >= high 5".to_string(),
        };

        assert!(error.to_string().contains("Invalid range"));
        assert!(error.to_string().contains("horizon"));
        assert!(error.to_string().contains("low 10 >= high 5"));
    }

    #[test]
    fn test_error_conversion() {
        let sim_error = SimulationError::LinAlg {
            message: "singular matrix".to_string(),
        };
        let ct_error: CtError = sim_error.into();

        match ct_error {
            CtError::Simulation(SimulationError::LinAlg { .. }) => (),
            _ => panic!("Expected Simulation error"),
        }
    }

    #[test]
    fn unbounded_timeout_survives_json() {
        let error = WorkerError::Timeout {
            seconds: f64::INFINITY,
        };
        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("\"inf\""), "{json}");
        let back: WorkerError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, error);
    }

    #[test]
    fn test_numerical_classification() {
        assert!(SimulationError::LinAlg { message: "x".into() }.is_numerical());
        assert!(SimulationError::NonFinite { step: 3 }.is_numerical());
        assert!(!SimulationError::DimensionMismatch { expected: 2, actual: 1 }.is_numerical());
        assert!(!SimulationError::Controller { message: "x".into() }.is_numerical());
    }

    #[test]
    fn test_macros() {
        let _validation_err = validation_error!("Invalid value: {}", 42);
        let _internal_err = internal_error!("Something went wrong");
        let config_err = config_error!("Missing surrogate factory for mode {}", "autotune");
        assert!(config_err.to_string().contains("autotune"));
    }
}
