//! Log-space density and distribution functions shared by the noise models
//! and the priors.

use statrs::distribution::{ContinuousCDF, Normal};

use crate::likelihood::LikelihoodError;

// ln(2π) = ln(2) + ln(π) ≈ 1.8378770664093453
pub(crate) const LOG_2PI: f64 = 1.8378770664093453_f64;

/// Log of the normal density
///
/// ```text
/// log(φ(x; μ, σ)) = -0.5 * ln(2π) - ln(σ) - (x - μ)² / (2σ²)
/// ```
#[inline(always)]
pub fn lognormpdf(obs: f64, pred: f64, sigma: f64) -> f64 {
    let diff = obs - pred;
    -0.5 * LOG_2PI - sigma.ln() - (diff * diff) / (2.0 * sigma * sigma)
}

/// Derivatives of [lognormpdf] with respect to `pred` and `sigma`
#[inline(always)]
pub fn lognormpdf_grad(obs: f64, pred: f64, sigma: f64) -> (f64, f64) {
    let diff = obs - pred;
    let s2 = sigma * sigma;
    (diff / s2, -1.0 / sigma + diff * diff / (s2 * sigma))
}

/// Log of the log-normal density of `obs` with median `pred`
///
/// Non-positive `obs` or `pred` have zero density.
#[inline(always)]
pub fn loglognormpdf(obs: f64, pred: f64, sigma: f64) -> f64 {
    if obs <= 0.0 || pred <= 0.0 {
        return f64::NEG_INFINITY;
    }
    lognormpdf(obs.ln(), pred.ln(), sigma) - obs.ln()
}

/// Derivatives of [loglognormpdf] with respect to `pred` and `sigma`
#[inline(always)]
pub fn loglognormpdf_grad(obs: f64, pred: f64, sigma: f64) -> (f64, f64) {
    if obs <= 0.0 || pred <= 0.0 {
        return (0.0, 0.0);
    }
    let (dmu, dsigma) = lognormpdf_grad(obs.ln(), pred.ln(), sigma);
    (dmu / pred, dsigma)
}

/// Log of the normal CDF
///
/// For extremely small CDF values (z < -37) an asymptotic expansion avoids
/// underflow to zero.
#[inline(always)]
pub fn lognormcdf(obs: f64, pred: f64, sigma: f64) -> Result<f64, LikelihoodError> {
    let norm = Normal::new(pred, sigma).map_err(|e| LikelihoodError::Distribution(e.to_string()))?;
    let cdf = norm.cdf(obs);
    if cdf <= 0.0 {
        // log(Φ(x)) ≈ log(φ(x)) - log(-x) for large negative x
        let z = (obs - pred) / sigma;
        if z < -37.0 {
            Ok(lognormpdf(obs, pred, sigma) - z.abs().ln())
        } else {
            Err(LikelihoodError::Distribution(format!(
                "normal CDF underflow at z = {z}"
            )))
        }
    } else {
        Ok(cdf.ln())
    }
}

/// Log of the normal survival function (1 - CDF)
#[inline(always)]
pub fn lognormccdf(obs: f64, pred: f64, sigma: f64) -> Result<f64, LikelihoodError> {
    let norm = Normal::new(pred, sigma).map_err(|e| LikelihoodError::Distribution(e.to_string()))?;
    let sf = norm.sf(obs);
    if sf <= 0.0 {
        let z = (obs - pred) / sigma;
        if z > 37.0 {
            Ok(lognormpdf(obs, pred, sigma) - z.ln())
        } else {
            Err(LikelihoodError::Distribution(format!(
                "normal survival function underflow at z = {z}"
            )))
        }
    } else {
        Ok(sf.ln())
    }
}

/// Log of the normal probability mass on `[lower, upper]`; either bound may
/// be infinite
pub fn lognormmass(lower: f64, upper: f64, mu: f64, sigma: f64) -> Result<f64, LikelihoodError> {
    match (lower.is_finite(), upper.is_finite()) {
        (false, false) => Ok(0.0),
        (true, false) => lognormccdf(lower, mu, sigma),
        (false, true) => lognormcdf(upper, mu, sigma),
        (true, true) => {
            let norm = Normal::new(mu, sigma)
                .map_err(|e| LikelihoodError::Distribution(e.to_string()))?;
            // Work in the tail farther from the mean to limit cancellation
            let mass = if lower > mu {
                norm.sf(lower) - norm.sf(upper)
            } else {
                norm.cdf(upper) - norm.cdf(lower)
            };
            if mass > 0.0 {
                Ok(mass.ln())
            } else {
                Err(LikelihoodError::Distribution(format!(
                    "no probability mass in [{lower}, {upper}]"
                )))
            }
        }
    }
}
