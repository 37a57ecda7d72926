use serde::{Deserialize, Serialize};

use crate::likelihood::distributions::{
    loglognormpdf, loglognormpdf_grad, lognormpdf, lognormpdf_grad,
};

/// Observation noise around the model prediction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoiseModel {
    /// `obs ~ Normal(pred, sigma)`
    #[default]
    Gaussian,
    /// `ln(obs) ~ Normal(ln(pred), sigma)`; requires positive observations
    LogNormal,
}

impl NoiseModel {
    /// Log density of one observation and its derivatives with respect to
    /// the prediction and the scale
    pub fn log_density(&self, obs: f64, pred: f64, sigma: f64) -> (f64, f64, f64) {
        match self {
            NoiseModel::Gaussian => {
                let (dp, ds) = lognormpdf_grad(obs, pred, sigma);
                (lognormpdf(obs, pred, sigma), dp, ds)
            }
            NoiseModel::LogNormal => {
                let (dp, ds) = loglognormpdf_grad(obs, pred, sigma);
                (loglognormpdf(obs, pred, sigma), dp, ds)
            }
        }
    }

    /// Whether `obs` lies in the support of the noise model
    pub fn supports(&self, obs: f64) -> bool {
        match self {
            NoiseModel::Gaussian => obs.is_finite(),
            NoiseModel::LogNormal => obs.is_finite() && obs > 0.0,
        }
    }
}
