//! Built-in vector fields with analytic Jacobians.

use serde::{Deserialize, Serialize};

use crate::simulator::field::VectorField;
use crate::simulator::{M, T, V};

/// Velocity of a falling body under linear drag
///
/// `dy/dt = m*g - gamma*y` with parameters `p = [gamma, g]`. The mass is a
/// fixed property of the model, not a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreeFall {
    pub mass: f64,
}

impl Default for FreeFall {
    fn default() -> Self {
        FreeFall { mass: 2.0 }
    }
}

impl FreeFall {
    pub fn new(mass: f64) -> Self {
        FreeFall { mass }
    }

    /// Closed-form solution `mg/gamma + (y0 - mg/gamma) * exp(-gamma t)`
    pub fn solution(&self, y0: f64, gamma: f64, g: f64, t: f64) -> f64 {
        let terminal = self.mass * g / gamma;
        terminal + (y0 - terminal) * (-gamma * t).exp()
    }
}

impl VectorField for FreeFall {
    fn nstates(&self) -> usize {
        1
    }

    fn nparams(&self) -> usize {
        2
    }

    fn evaluate(&self, y: &V, _t: T, p: &V, dy: &mut V) {
        crate::fetch_params!(p, gamma, g);
        dy[0] = self.mass * g - gamma * y[0];
    }

    fn jacobian_state(&self, _y: &V, _t: T, p: &V, jac: &mut M) {
        jac[(0, 0)] = -p[0];
    }

    fn jacobian_params(&self, y: &V, _t: T, _p: &V, jac: &mut M) {
        jac[(0, 0)] = -y[0];
        jac[(0, 1)] = self.mass;
    }
}

/// Susceptible-infected-recovered epidemic, in population fractions
///
/// States are `[S, I]` (the recovered fraction is `1 - S - I`), parameters
/// are `[beta, gamma]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Sir;

impl VectorField for Sir {
    fn nstates(&self) -> usize {
        2
    }

    fn nparams(&self) -> usize {
        2
    }

    fn evaluate(&self, y: &V, _t: T, p: &V, dy: &mut V) {
        crate::fetch_params!(p, beta, gamma);
        let (s, i) = (y[0], y[1]);
        dy[0] = -beta * s * i;
        dy[1] = beta * s * i - gamma * i;
    }

    fn jacobian_state(&self, y: &V, _t: T, p: &V, jac: &mut M) {
        crate::fetch_params!(p, beta, gamma);
        let (s, i) = (y[0], y[1]);
        jac[(0, 0)] = -beta * i;
        jac[(0, 1)] = -beta * s;
        jac[(1, 0)] = beta * i;
        jac[(1, 1)] = beta * s - gamma;
    }

    fn jacobian_params(&self, y: &V, _t: T, _p: &V, jac: &mut M) {
        let (s, i) = (y[0], y[1]);
        jac[(0, 0)] = -s * i;
        jac[(0, 1)] = 0.0;
        jac[(1, 0)] = s * i;
        jac[(1, 1)] = -i;
    }
}
