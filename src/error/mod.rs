use thiserror::Error;

use crate::data::parser::DataError;
use crate::likelihood::LikelihoodError;
use crate::simulator::integrator::IntegrationError;

/// Errors detected while a problem, model or sampler is being set up.
///
/// These are fatal: a run never starts with an invalid configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("dimension mismatch for {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        got: usize,
    },
    #[error("observation time {time} precedes t0 = {t0}")]
    TimeBeforeStart { time: f64, t0: f64 },
    #[error("times must be finite and strictly increasing (index {index}: {previous} -> {current})")]
    NonIncreasingTimes {
        index: usize,
        previous: f64,
        current: f64,
    },
    #[error("observation time {got} at index {index} does not match the problem time {expected}")]
    TimeMismatch {
        index: usize,
        expected: f64,
        got: f64,
    },
    #[error("no observation times were given")]
    EmptyTimes,
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("parameter '{0}' is declared more than once")]
    DuplicateParameter(String),
}

impl ConfigError {
    pub(crate) fn mismatch(what: impl Into<String>, expected: usize, got: usize) -> Self {
        ConfigError::DimensionMismatch {
            what: what.into(),
            expected,
            got,
        }
    }

    pub(crate) fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum OdeFitError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Integration failure: {0}")]
    Integration(#[from] IntegrationError),
    #[error("Error in the likelihood: {0}")]
    Likelihood(#[from] LikelihoodError),
    #[error("Error reading data: {0}")]
    Data(#[from] DataError),
    #[error("Optimization failed: {0}")]
    Optimization(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OdeFitError {
    /// Whether the sampler may absorb this error by rejecting the proposal.
    ///
    /// Integration failures and likelihood evaluation failures depend on the
    /// proposed parameters; everything else is a setup problem.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OdeFitError::Integration(_) | OdeFitError::Likelihood(_)
        )
    }
}
