//! Bijections between the unconstrained sampling space and a prior's support.

use serde::{Deserialize, Serialize};

/// Map from `z` in the real line to `x` in a parameter's support
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Transform {
    /// `x = z`
    Identity,
    /// `x = a + exp(z)`, support `(a, inf)`
    LowerBound(f64),
    /// `x = b - exp(z)`, support `(-inf, b)`
    UpperBound(f64),
    /// `x = a + (b - a) * sigmoid(z)`, support `(a, b)`
    Interval(f64, f64),
}

/// Stable `log(1 + exp(x))`
#[inline]
fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

#[inline]
fn sigmoid(x: f64) -> f64 {
    let e = (-x.abs()).exp();
    if x >= 0.0 {
        1.0 / (1.0 + e)
    } else {
        e / (1.0 + e)
    }
}

impl Transform {
    /// The transform onto `(lower, upper)`; infinite bounds are open
    pub fn for_support(lower: f64, upper: f64) -> Self {
        match (lower.is_finite(), upper.is_finite()) {
            (false, false) => Transform::Identity,
            (true, false) => Transform::LowerBound(lower),
            (false, true) => Transform::UpperBound(upper),
            (true, true) => Transform::Interval(lower, upper),
        }
    }

    pub fn forward(&self, z: f64) -> f64 {
        match *self {
            Transform::Identity => z,
            Transform::LowerBound(a) => a + z.exp(),
            Transform::UpperBound(b) => b - z.exp(),
            Transform::Interval(a, b) => a + (b - a) * sigmoid(z),
        }
    }

    /// Values on or past a finite bound are nudged inside it
    pub fn inverse(&self, x: f64) -> f64 {
        match *self {
            Transform::Identity => x,
            Transform::LowerBound(a) => (x - a).max(1e-300).ln(),
            Transform::UpperBound(b) => (b - x).max(1e-300).ln(),
            Transform::Interval(a, b) => {
                let p = ((x - a) / (b - a)).clamp(1e-15, 1.0 - 1e-15);
                (p / (1.0 - p)).ln()
            }
        }
    }

    /// `dx/dz`
    pub fn dx_dz(&self, z: f64) -> f64 {
        match *self {
            Transform::Identity => 1.0,
            Transform::LowerBound(_) => z.exp(),
            Transform::UpperBound(_) => -z.exp(),
            Transform::Interval(a, b) => (b - a) * sigmoid(z) * sigmoid(-z),
        }
    }

    /// `log|dx/dz|`
    pub fn log_abs_jacobian(&self, z: f64) -> f64 {
        match *self {
            Transform::Identity => 0.0,
            Transform::LowerBound(_) | Transform::UpperBound(_) => z,
            Transform::Interval(a, b) => (b - a).ln() - softplus(-z) - softplus(z),
        }
    }

    /// `d/dz log|dx/dz|`
    pub fn grad_log_abs_jacobian(&self, z: f64) -> f64 {
        match *self {
            Transform::Identity => 0.0,
            Transform::LowerBound(_) | Transform::UpperBound(_) => 1.0,
            Transform::Interval(..) => 1.0 - 2.0 * sigmoid(z),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const ALL: [Transform; 4] = [
        Transform::Identity,
        Transform::LowerBound(1.0),
        Transform::UpperBound(-2.0),
        Transform::Interval(-1.0, 3.0),
    ];

    #[test]
    fn inverse_undoes_forward() {
        for t in ALL {
            for &z in &[-3.0, -0.2, 0.0, 1.7] {
                assert_relative_eq!(t.inverse(t.forward(z)), z, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn jacobian_terms_match_finite_differences() {
        let h = 1e-6;
        for t in ALL {
            for &z in &[-2.5, 0.3, 1.9] {
                let fd = (t.forward(z + h) - t.forward(z - h)) / (2.0 * h);
                assert_relative_eq!(t.dx_dz(z), fd, max_relative = 1e-6);
                assert_relative_eq!(t.log_abs_jacobian(z), t.dx_dz(z).abs().ln(), epsilon = 1e-10);
                let fd = (t.log_abs_jacobian(z + h) - t.log_abs_jacobian(z - h)) / (2.0 * h);
                assert_relative_eq!(t.grad_log_abs_jacobian(z), fd, epsilon = 1e-7);
            }
        }
    }

    #[test]
    fn support_selects_transform() {
        assert_eq!(
            Transform::for_support(f64::NEG_INFINITY, f64::INFINITY),
            Transform::Identity
        );
        assert_eq!(Transform::for_support(0.0, f64::INFINITY), Transform::LowerBound(0.0));
        assert_eq!(Transform::for_support(0.0, 1.0), Transform::Interval(0.0, 1.0));
        assert!(Transform::LowerBound(0.0).forward(-50.0) > 0.0);
        assert!(Transform::LowerBound(0.0).inverse(0.0).is_finite());
    }
}
