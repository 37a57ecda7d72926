use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How one model input (a `theta`, `y0` or noise-scale slot, or a derived
/// quantity) is obtained from the named free parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    Fixed(f64),
    Free(String),
    /// Product of two free parameters, e.g. `beta = R0 * lambda`
    Product(String, String),
    /// A free parameter times a constant
    Scaled(String, f64),
}

impl Binding {
    pub fn fixed(value: f64) -> Self {
        Binding::Fixed(value)
    }

    pub fn free(name: impl Into<String>) -> Self {
        Binding::Free(name.into())
    }

    pub fn product(a: impl Into<String>, b: impl Into<String>) -> Self {
        Binding::Product(a.into(), b.into())
    }

    pub fn scaled(name: impl Into<String>, factor: f64) -> Self {
        Binding::Scaled(name.into(), factor)
    }

    /// Resolve names against the declared free parameters
    pub(crate) fn resolve(&self, names: &[String]) -> Result<Input, ConfigError> {
        let index = |name: &str| {
            names
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| ConfigError::UnknownParameter(name.to_string()))
        };
        match self {
            Binding::Fixed(v) => {
                if !v.is_finite() {
                    return Err(ConfigError::invalid("fixed binding", "value must be finite"));
                }
                Ok(Input::Fixed(*v))
            }
            Binding::Free(name) => Ok(Input::Free(index(name)?)),
            Binding::Product(a, b) => Ok(Input::Product(index(a)?, index(b)?)),
            Binding::Scaled(name, c) => {
                if !c.is_finite() {
                    return Err(ConfigError::invalid("scaled binding", "factor must be finite"));
                }
                Ok(Input::Scaled(index(name)?, *c))
            }
        }
    }
}

impl From<f64> for Binding {
    fn from(value: f64) -> Self {
        Binding::Fixed(value)
    }
}

impl From<&str> for Binding {
    fn from(name: &str) -> Self {
        Binding::Free(name.to_string())
    }
}

/// A resolved [Binding], indexing into the constrained parameter vector
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Input {
    Fixed(f64),
    Free(usize),
    Product(usize, usize),
    Scaled(usize, f64),
}

impl Input {
    pub(crate) fn value(&self, x: &[f64]) -> f64 {
        match *self {
            Input::Fixed(v) => v,
            Input::Free(i) => x[i],
            Input::Product(i, j) => x[i] * x[j],
            Input::Scaled(i, c) => c * x[i],
        }
    }

    /// Add `g * d(value)/dx` into `grad`
    pub(crate) fn accumulate(&self, g: f64, x: &[f64], grad: &mut [f64]) {
        match *self {
            Input::Fixed(_) => {}
            Input::Free(i) => grad[i] += g,
            Input::Product(i, j) => {
                grad[i] += g * x[j];
                grad[j] += g * x[i];
            }
            Input::Scaled(i, c) => grad[i] += g * c,
        }
    }
}
