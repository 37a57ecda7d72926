use rand::Rng;
use rand_distr::{Distribution, Exp1, Gamma as GammaDist, StandardNormal};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Gamma, Normal};
use statrs::function::gamma::ln_gamma;

use crate::error::ConfigError;
use crate::likelihood::distributions::{lognormmass, lognormpdf};
use crate::model::transform::Transform;

const LN_2: f64 = std::f64::consts::LN_2;

/// Prior distribution of one free scalar
///
/// Densities are normalized, so a run without a likelihood samples the prior
/// itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Prior {
    /// Improper uniform density on the real line
    Flat,
    Normal {
        mu: f64,
        sigma: f64,
    },
    HalfNormal {
        sigma: f64,
    },
    HalfCauchy {
        beta: f64,
    },
    /// `ln(x) ~ Normal(mu, sigma)`
    LogNormal {
        mu: f64,
        sigma: f64,
    },
    Exponential {
        rate: f64,
    },
    Gamma {
        shape: f64,
        rate: f64,
    },
    Uniform {
        lower: f64,
        upper: f64,
    },
    /// Normal restricted to `[lower, upper]`; a missing bound is infinite
    TruncatedNormal {
        mu: f64,
        sigma: f64,
        #[serde(default)]
        lower: Option<f64>,
        #[serde(default)]
        upper: Option<f64>,
    },
}

impl Prior {
    pub fn normal(mu: f64, sigma: f64) -> Self {
        Prior::Normal { mu, sigma }
    }

    pub fn half_normal(sigma: f64) -> Self {
        Prior::HalfNormal { sigma }
    }

    pub fn half_cauchy(beta: f64) -> Self {
        Prior::HalfCauchy { beta }
    }

    pub fn log_normal(mu: f64, sigma: f64) -> Self {
        Prior::LogNormal { mu, sigma }
    }

    pub fn exponential(rate: f64) -> Self {
        Prior::Exponential { rate }
    }

    pub fn gamma(shape: f64, rate: f64) -> Self {
        Prior::Gamma { shape, rate }
    }

    pub fn uniform(lower: f64, upper: f64) -> Self {
        Prior::Uniform { lower, upper }
    }

    pub fn truncated_normal(mu: f64, sigma: f64, lower: Option<f64>, upper: Option<f64>) -> Self {
        Prior::TruncatedNormal {
            mu,
            sigma,
            lower,
            upper,
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let positive = |what: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::invalid(
                    name,
                    format!("{} must be finite and positive, got {}", what, v),
                ))
            }
        };
        let finite = |what: &str, v: f64| {
            if v.is_finite() {
                Ok(())
            } else {
                Err(ConfigError::invalid(
                    name,
                    format!("{} must be finite, got {}", what, v),
                ))
            }
        };
        match *self {
            Prior::Flat => Ok(()),
            Prior::Normal { mu, sigma } | Prior::LogNormal { mu, sigma } => {
                finite("mu", mu)?;
                positive("sigma", sigma)
            }
            Prior::HalfNormal { sigma } => positive("sigma", sigma),
            Prior::HalfCauchy { beta } => positive("beta", beta),
            Prior::Exponential { rate } => positive("rate", rate),
            Prior::Gamma { shape, rate } => {
                positive("shape", shape)?;
                positive("rate", rate)
            }
            Prior::Uniform { lower, upper } => {
                finite("lower", lower)?;
                finite("upper", upper)?;
                if upper <= lower {
                    return Err(ConfigError::invalid(name, "upper must exceed lower"));
                }
                Ok(())
            }
            Prior::TruncatedNormal {
                mu,
                sigma,
                lower,
                upper,
            } => {
                finite("mu", mu)?;
                positive("sigma", sigma)?;
                let (a, b) = self.support();
                if a.is_nan() || b.is_nan() || b <= a {
                    return Err(ConfigError::invalid(name, "upper must exceed lower"));
                }
                if lower.is_some_and(|l| l.is_infinite()) || upper.is_some_and(|u| u.is_infinite())
                {
                    return Err(ConfigError::invalid(
                        name,
                        "leave a bound unset instead of making it infinite",
                    ));
                }
                lognormmass(a, b, mu, sigma)
                    .map(|_| ())
                    .map_err(|e| ConfigError::invalid(name, e.to_string()))
            }
        }
    }

    /// `(lower, upper)` bounds of the support
    pub fn support(&self) -> (f64, f64) {
        match *self {
            Prior::Flat | Prior::Normal { .. } => (f64::NEG_INFINITY, f64::INFINITY),
            Prior::HalfNormal { .. }
            | Prior::HalfCauchy { .. }
            | Prior::LogNormal { .. }
            | Prior::Exponential { .. }
            | Prior::Gamma { .. } => (0.0, f64::INFINITY),
            Prior::Uniform { lower, upper } => (lower, upper),
            Prior::TruncatedNormal { lower, upper, .. } => (
                lower.unwrap_or(f64::NEG_INFINITY),
                upper.unwrap_or(f64::INFINITY),
            ),
        }
    }

    /// Bijection from the real line onto the support
    pub fn transform(&self) -> Transform {
        let (lower, upper) = self.support();
        Transform::for_support(lower, upper)
    }

    fn in_support(&self, x: f64) -> bool {
        let (lower, upper) = self.support();
        x >= lower && x <= upper
    }

    /// Log of the parent mass over the support. Only the truncated normal has
    /// one that is not 0; it costs two CDF evaluations.
    pub(crate) fn log_mass(&self) -> f64 {
        match *self {
            Prior::TruncatedNormal { mu, sigma, .. } => {
                let (a, b) = self.support();
                // Validated priors always have mass
                lognormmass(a, b, mu, sigma).unwrap_or(0.0)
            }
            _ => 0.0,
        }
    }

    pub fn log_density(&self, x: f64) -> f64 {
        self.log_density_with_mass(x, self.log_mass())
    }

    /// [Prior::log_density] with [Prior::log_mass] supplied by the caller
    pub(crate) fn log_density_with_mass(&self, x: f64, log_mass: f64) -> f64 {
        if !self.in_support(x) {
            return f64::NEG_INFINITY;
        }
        match *self {
            Prior::Flat => 0.0,
            Prior::Normal { mu, sigma } => lognormpdf(x, mu, sigma),
            Prior::HalfNormal { sigma } => LN_2 + lognormpdf(x, 0.0, sigma),
            Prior::HalfCauchy { beta } => {
                (2.0 / (std::f64::consts::PI * beta)).ln() - (x / beta).powi(2).ln_1p()
            }
            Prior::LogNormal { mu, sigma } => {
                if x <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                lognormpdf(x.ln(), mu, sigma) - x.ln()
            }
            Prior::Exponential { rate } => rate.ln() - rate * x,
            Prior::Gamma { shape, rate } => {
                if x <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                shape * rate.ln() - ln_gamma(shape) + (shape - 1.0) * x.ln() - rate * x
            }
            Prior::Uniform { lower, upper } => -(upper - lower).ln(),
            Prior::TruncatedNormal { mu, sigma, .. } => lognormpdf(x, mu, sigma) - log_mass,
        }
    }

    /// `d/dx` of [Prior::log_density] inside the support
    pub fn grad_log_density(&self, x: f64) -> f64 {
        match *self {
            Prior::Flat | Prior::Uniform { .. } => 0.0,
            Prior::Normal { mu, sigma } | Prior::TruncatedNormal { mu, sigma, .. } => {
                -(x - mu) / (sigma * sigma)
            }
            Prior::HalfNormal { sigma } => -x / (sigma * sigma),
            Prior::HalfCauchy { beta } => -2.0 * x / (beta * beta + x * x),
            Prior::LogNormal { mu, sigma } => -((x.ln() - mu) / (sigma * sigma) + 1.0) / x,
            Prior::Exponential { rate } => -rate,
            Prior::Gamma { shape, rate } => (shape - 1.0) / x - rate,
        }
    }

    /// One draw from the prior
    ///
    /// A flat prior has no distribution to draw from; it yields a value in
    /// `[-2, 2)`.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        match *self {
            Prior::Flat => rng.random_range(-2.0..2.0),
            Prior::Normal { mu, sigma } => {
                let z: f64 = StandardNormal.sample(rng);
                mu + sigma * z
            }
            Prior::HalfNormal { sigma } => {
                let z: f64 = StandardNormal.sample(rng);
                sigma * z.abs()
            }
            Prior::HalfCauchy { beta } => {
                let u: f64 = rng.random();
                beta * (std::f64::consts::FRAC_PI_2 * u).tan()
            }
            Prior::LogNormal { mu, sigma } => {
                let z: f64 = StandardNormal.sample(rng);
                (mu + sigma * z).exp()
            }
            Prior::Exponential { rate } => {
                let e: f64 = Exp1.sample(rng);
                e / rate
            }
            Prior::Gamma { shape, rate } => match GammaDist::new(shape, 1.0 / rate) {
                Ok(dist) => dist.sample(rng),
                Err(_) => f64::NAN,
            },
            Prior::Uniform { lower, upper } => rng.random_range(lower..upper),
            Prior::TruncatedNormal { .. } => {
                let u: f64 = rng.random();
                self.truncated_quantile(u)
            }
        }
    }

    /// Median of the prior, used as a deterministic starting point
    pub fn median(&self) -> f64 {
        match *self {
            Prior::Flat => 0.0,
            Prior::Normal { mu, .. } => mu,
            Prior::HalfNormal { sigma } => sigma * 0.674_489_750_196_081_7,
            Prior::HalfCauchy { beta } => beta,
            Prior::LogNormal { mu, .. } => mu.exp(),
            Prior::Exponential { rate } => LN_2 / rate,
            Prior::Gamma { shape, rate } => match Gamma::new(shape, rate) {
                Ok(dist) => dist.inverse_cdf(0.5),
                Err(_) => shape / rate,
            },
            Prior::Uniform { lower, upper } => 0.5 * (lower + upper),
            Prior::TruncatedNormal { .. } => self.truncated_quantile(0.5),
        }
    }

    /// Quantile of a truncated normal by inverting the CDF of the parent
    fn truncated_quantile(&self, u: f64) -> f64 {
        let Prior::TruncatedNormal { mu, sigma, .. } = *self else {
            return f64::NAN;
        };
        let (a, b) = self.support();
        let norm = match Normal::new(mu, sigma) {
            Ok(norm) => norm,
            Err(_) => return f64::NAN,
        };
        let (fa, fb) = (norm.cdf(a), norm.cdf(b));
        let x = norm.inverse_cdf(fa + u * (fb - fa));
        // Guard against rounding at the bounds in the far tails
        x.clamp(a, b)
    }
}
