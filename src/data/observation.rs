use serde::{Deserialize, Serialize};

use crate::data::builder::ObservationsBuilder;
use crate::error::ConfigError;

/// Observation times and values, one row per time.
///
/// Rows are stored in time order; `values[i][k]` is the value of column `k` at
/// `times[i]`. A `NaN` entry is a missing value and is ignored by the
/// likelihood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observations {
    names: Vec<String>,
    times: Vec<f64>,
    #[serde(with = "missing_as_null")]
    values: Vec<Vec<f64>>,
}

impl Observations {
    /// Create a validated observation set
    ///
    /// Times must be finite, non-empty and strictly increasing, and every row
    /// must have one entry per column name.
    pub fn new(
        names: Vec<String>,
        times: Vec<f64>,
        values: Vec<Vec<f64>>,
    ) -> Result<Self, ConfigError> {
        validate_times(&times)?;
        if names.is_empty() {
            return Err(ConfigError::invalid(
                "observations",
                "at least one observed column is required",
            ));
        }
        if values.len() != times.len() {
            return Err(ConfigError::mismatch(
                "observation rows",
                times.len(),
                values.len(),
            ));
        }
        for (i, row) in values.iter().enumerate() {
            if row.len() != names.len() {
                return Err(ConfigError::mismatch(
                    format!("observation row {}", i),
                    names.len(),
                    row.len(),
                ));
            }
            if row.iter().any(|v| v.is_infinite()) {
                return Err(ConfigError::invalid(
                    format!("observation row {}", i),
                    "values must be finite or NaN (missing)",
                ));
            }
        }
        Ok(Observations {
            names,
            times,
            values,
        })
    }

    pub fn builder() -> ObservationsBuilder {
        ObservationsBuilder::new()
    }

    pub fn n_times(&self) -> usize {
        self.times.len()
    }

    pub fn n_columns(&self) -> usize {
        self.names.len()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Value of column `column` at the `time_index`-th time; `NaN` if missing
    pub fn value(&self, time_index: usize, column: usize) -> f64 {
        self.values[time_index][column]
    }

    pub fn is_missing(&self, time_index: usize, column: usize) -> bool {
        self.values[time_index][column].is_nan()
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.values
    }

    /// All values of one column, in time order
    pub fn column(&self, column: usize) -> Vec<f64> {
        self.values.iter().map(|row| row[column]).collect()
    }

    /// Index of a column by name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Number of non-missing values
    pub fn n_observed(&self) -> usize {
        self.values
            .iter()
            .flat_map(|row| row.iter())
            .filter(|v| !v.is_nan())
            .count()
    }
}

/// Times must be non-empty, finite and strictly increasing.
pub(crate) fn validate_times(times: &[f64]) -> Result<(), ConfigError> {
    if times.is_empty() {
        return Err(ConfigError::EmptyTimes);
    }
    if !times[0].is_finite() {
        return Err(ConfigError::NonIncreasingTimes {
            index: 0,
            previous: f64::NEG_INFINITY,
            current: times[0],
        });
    }
    for (index, pair) in times.windows(2).enumerate() {
        let (previous, current) = (pair[0], pair[1]);
        if !current.is_finite() || current <= previous {
            return Err(ConfigError::NonIncreasingTimes {
                index: index + 1,
                previous,
                current,
            });
        }
    }
    Ok(())
}

// JSON has no NaN, so missing values travel as `null`.
mod missing_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(values: &[Vec<f64>], s: S) -> Result<S::Ok, S::Error> {
        let rows: Vec<Vec<Option<f64>>> = values
            .iter()
            .map(|row| {
                row.iter()
                    .map(|v| if v.is_nan() { None } else { Some(*v) })
                    .collect()
            })
            .collect();
        rows.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<f64>>, D::Error> {
        let rows = Vec::<Vec<Option<f64>>>::deserialize(d)?;
        Ok(rows
            .into_iter()
            .map(|row| row.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
            .collect())
    }
}
