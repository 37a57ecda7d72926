//! Observed time-series data.
//!
//! An [Observations] set holds the observation times and one value per
//! observed column at each time. Missing values are stored as `NaN`.
pub mod builder;
pub mod observation;
pub mod parser;

pub use builder::ObservationsBuilder;
pub use observation::Observations;
pub use parser::{read_observations, DataError};
