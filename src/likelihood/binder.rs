use std::sync::Arc;

use crate::data::Observations;
use crate::error::ConfigError;
use crate::likelihood::{LikelihoodError, NoiseModel};
use crate::simulator::{OdeProblem, Trajectory, VectorField};

/// Relative tolerance when matching observation times to problem times
const TIME_TOLERANCE: f64 = 1e-12;

fn match_times(expected: &[f64], got: &[f64]) -> Result<(), ConfigError> {
    if got.len() != expected.len() {
        return Err(ConfigError::mismatch(
            "observation times",
            expected.len(),
            got.len(),
        ));
    }
    for (index, (&expected, &got)) in expected.iter().zip(got).enumerate() {
        if (expected - got).abs() > TIME_TOLERANCE * expected.abs().max(1.0) {
            return Err(ConfigError::TimeMismatch {
                index,
                expected,
                got,
            });
        }
    }
    Ok(())
}

/// Log-likelihood and its gradient with respect to every model input
#[derive(Debug, Clone, PartialEq)]
pub struct LikelihoodGradient {
    pub value: f64,
    pub d_theta: Vec<f64>,
    pub d_y0: Vec<f64>,
    pub d_sigma: Vec<f64>,
}

/// Connects a problem's trajectory to a set of observations
///
/// Observed column `k` is compared with state `state_map[k]`. Each column has
/// its own noise scale. Construction checks every shape once, so evaluation
/// can only fail on invalid scales.
#[derive(Debug, Clone)]
pub struct LikelihoodBinder {
    observations: Arc<Observations>,
    state_map: Vec<usize>,
    noise: NoiseModel,
    n_states: usize,
    n_theta: usize,
}

impl LikelihoodBinder {
    pub fn new<F: VectorField>(
        problem: &OdeProblem<F>,
        observations: impl Into<Arc<Observations>>,
        state_map: Vec<usize>,
        noise: NoiseModel,
    ) -> Result<Self, ConfigError> {
        let observations = observations.into();

        match_times(problem.times(), observations.times())?;

        if state_map.len() != observations.n_columns() {
            return Err(ConfigError::mismatch(
                "observed columns",
                state_map.len(),
                observations.n_columns(),
            ));
        }
        let n_states = problem.n_states();
        if let Some(&bad) = state_map.iter().find(|&&s| s >= n_states) {
            return Err(ConfigError::invalid(
                "state_map",
                format!("state index {} out of range for {} states", bad, n_states),
            ));
        }

        for (i, row) in observations.rows().iter().enumerate() {
            for (k, &obs) in row.iter().enumerate() {
                if !obs.is_nan() && !noise.supports(obs) {
                    return Err(ConfigError::invalid(
                        format!("observation ({}, {})", i, observations.names()[k]),
                        format!("{} is outside the support of the {:?} noise model", obs, noise),
                    ));
                }
            }
        }

        Ok(LikelihoodBinder {
            observations,
            state_map,
            noise,
            n_states,
            n_theta: problem.n_theta(),
        })
    }

    /// Check that `problem` has the shape and output times this binder was
    /// built against
    pub(crate) fn check_problem<F: VectorField>(
        &self,
        problem: &OdeProblem<F>,
    ) -> Result<(), ConfigError> {
        if problem.n_states() != self.n_states {
            return Err(ConfigError::mismatch(
                "likelihood states",
                problem.n_states(),
                self.n_states,
            ));
        }
        if problem.n_theta() != self.n_theta {
            return Err(ConfigError::mismatch(
                "likelihood parameters",
                problem.n_theta(),
                self.n_theta,
            ));
        }
        match_times(problem.times(), self.observations.times())
    }

    /// Observed column `k` is state `k`
    pub fn identity<F: VectorField>(
        problem: &OdeProblem<F>,
        observations: impl Into<Arc<Observations>>,
        noise: NoiseModel,
    ) -> Result<Self, ConfigError> {
        let observations = observations.into();
        let map = (0..observations.n_columns()).collect();
        Self::new(problem, observations, map, noise)
    }

    pub fn observations(&self) -> &Arc<Observations> {
        &self.observations
    }

    pub fn state_map(&self) -> &[usize] {
        &self.state_map
    }

    pub fn noise(&self) -> NoiseModel {
        self.noise
    }

    /// Number of noise scales the binder expects
    pub fn n_columns(&self) -> usize {
        self.state_map.len()
    }

    fn check_scales(&self, sigma: &[f64]) -> Result<(), LikelihoodError> {
        if sigma.len() != self.n_columns() {
            return Err(LikelihoodError::ScaleCount {
                expected: self.n_columns(),
                got: sigma.len(),
            });
        }
        match sigma
            .iter()
            .enumerate()
            .find(|(_, s)| !s.is_finite() || **s <= 0.0)
        {
            Some((column, &value)) => Err(LikelihoodError::InvalidScale { column, value }),
            None => Ok(()),
        }
    }

    pub fn log_likelihood(&self, traj: &Trajectory, sigma: &[f64]) -> Result<f64, LikelihoodError> {
        self.check_scales(sigma)?;
        let mut value = 0.0;
        for (i, row) in self.observations.rows().iter().enumerate() {
            for (k, &obs) in row.iter().enumerate() {
                if obs.is_nan() {
                    continue;
                }
                let pred = traj.value(i, self.state_map[k]);
                value += self.noise.log_density(obs, pred, sigma[k]).0;
            }
        }
        Ok(value)
    }

    /// Log-likelihood with its gradient, by the chain rule through the
    /// trajectory's sensitivities
    ///
    /// A prediction outside the noise model's support gives a value of
    /// `-inf` with a zero gradient.
    pub fn log_likelihood_with_gradient(
        &self,
        traj: &Trajectory,
        sigma: &[f64],
    ) -> Result<LikelihoodGradient, LikelihoodError> {
        self.check_scales(sigma)?;
        if !traj.has_sensitivities() {
            return Err(LikelihoodError::MissingSensitivities);
        }

        let mut grad = LikelihoodGradient {
            value: 0.0,
            d_theta: vec![0.0; self.n_theta],
            d_y0: vec![0.0; self.n_states],
            d_sigma: vec![0.0; sigma.len()],
        };

        for (i, row) in self.observations.rows().iter().enumerate() {
            let sens = match traj.sensitivity(i) {
                Some(s) => s,
                None => return Err(LikelihoodError::MissingSensitivities),
            };
            for (k, &obs) in row.iter().enumerate() {
                if obs.is_nan() {
                    continue;
                }
                let state = self.state_map[k];
                let pred = traj.value(i, state);
                let (lp, dpred, dsigma) = self.noise.log_density(obs, pred, sigma[k]);
                if lp == f64::NEG_INFINITY {
                    return Ok(LikelihoodGradient {
                        value: f64::NEG_INFINITY,
                        d_theta: vec![0.0; self.n_theta],
                        d_y0: vec![0.0; self.n_states],
                        d_sigma: vec![0.0; sigma.len()],
                    });
                }
                grad.value += lp;
                grad.d_sigma[k] += dsigma;
                for j in 0..self.n_theta {
                    grad.d_theta[j] += dpred * sens[(state, j)];
                }
                for j in 0..self.n_states {
                    grad.d_y0[j] += dpred * sens[(state, self.n_theta + j)];
                }
            }
        }
        Ok(grad)
    }
}
