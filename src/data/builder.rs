use crate::data::Observations;
use crate::error::ConfigError;

/// Row-by-row construction of an [Observations] set
///
/// ```rust
/// use odefit::data::Observations;
///
/// let obs = Observations::builder()
///     .column("susceptible")
///     .column("infected")
///     .row(0.25, &[0.97, 0.02])
///     .missing_row(0.5)
///     .build()
///     .unwrap();
/// assert_eq!(obs.n_times(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ObservationsBuilder {
    names: Vec<String>,
    times: Vec<f64>,
    values: Vec<Vec<f64>>,
}

impl ObservationsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    pub fn row(mut self, time: f64, values: &[f64]) -> Self {
        self.times.push(time);
        self.values.push(values.to_vec());
        self
    }

    /// Add a time at which every column is missing
    pub fn missing_row(mut self, time: f64) -> Self {
        self.times.push(time);
        self.values.push(vec![f64::NAN; self.names.len()]);
        self
    }

    /// Add one row per time for a single-column series
    pub fn series(mut self, times: &[f64], values: &[f64]) -> Self {
        for (t, v) in times.iter().zip(values.iter()) {
            self.times.push(*t);
            self.values.push(vec![*v]);
        }
        self
    }

    pub fn build(self) -> Result<Observations, ConfigError> {
        if self.names.is_empty() {
            return Err(ConfigError::invalid(
                "observations",
                "declare at least one column before building",
            ));
        }
        Observations::new(self.names, self.times, self.values)
    }
}
