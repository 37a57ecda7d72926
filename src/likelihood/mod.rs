//! From integrator output to a log-likelihood and its gradient.
pub mod binder;
pub mod distributions;
pub mod noise;

use thiserror::Error;

pub use binder::{LikelihoodBinder, LikelihoodGradient};
pub use noise::NoiseModel;

/// Failures while evaluating the likelihood at a proposed parameter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LikelihoodError {
    #[error("noise scale for column {column} must be finite and positive, got {value}")]
    InvalidScale { column: usize, value: f64 },
    #[error("expected {expected} noise scales, got {got}")]
    ScaleCount { expected: usize, got: usize },
    #[error("the trajectory was solved without sensitivities")]
    MissingSensitivities,
    #[error("distribution error: {0}")]
    Distribution(String),
}
