pub mod closure;
pub mod models;

use crate::simulator::{M, T, V};

/// Relative perturbation used by the finite-difference Jacobians
const FD_STEP: f64 = 6e-6;

/// Right-hand side `dy/dt = f(y, t, p)` of an ODE model.
///
/// Implementations must be pure: the same inputs always give the same
/// derivative, and evaluation never mutates shared state. Fields are shared
/// across sampler chains, hence the `Send + Sync` bound.
///
/// Both Jacobians default to central finite differences. Models with a known
/// closed form should override them; the sensitivities are only as accurate
/// as the Jacobians.
pub trait VectorField: Send + Sync {
    /// Number of state variables
    fn nstates(&self) -> usize;

    /// Number of parameters
    fn nparams(&self) -> usize;

    /// Write `f(y, t, p)` into `dy`, which has length [VectorField::nstates]
    fn evaluate(&self, y: &V, t: T, p: &V, dy: &mut V);

    /// `df/dy`, written into an `nstates x nstates` matrix
    fn jacobian_state(&self, y: &V, t: T, p: &V, jac: &mut M) {
        let n = y.len();
        let mut yp = y.clone();
        let mut fp = V::zeros(n);
        let mut fm = V::zeros(n);
        for j in 0..n {
            let orig = yp[j];
            let h = FD_STEP * (1.0 + orig.abs());
            yp[j] = orig + h;
            self.evaluate(&yp, t, p, &mut fp);
            yp[j] = orig - h;
            self.evaluate(&yp, t, p, &mut fm);
            yp[j] = orig;
            for i in 0..n {
                jac[(i, j)] = (fp[i] - fm[i]) / (2.0 * h);
            }
        }
    }

    /// `df/dp`, written into an `nstates x nparams` matrix
    fn jacobian_params(&self, y: &V, t: T, p: &V, jac: &mut M) {
        let n = y.len();
        let mut pp = p.clone();
        let mut fp = V::zeros(n);
        let mut fm = V::zeros(n);
        for j in 0..p.len() {
            let orig = pp[j];
            let h = FD_STEP * (1.0 + orig.abs());
            pp[j] = orig + h;
            self.evaluate(y, t, &pp, &mut fp);
            pp[j] = orig - h;
            self.evaluate(y, t, &pp, &mut fm);
            pp[j] = orig;
            for i in 0..n {
                jac[(i, j)] = (fp[i] - fm[i]) / (2.0 * h);
            }
        }
    }

    /// Whether the implicit integrator should be used when the method is
    /// left on [crate::simulator::Method::Auto]
    fn is_stiff(&self) -> bool {
        false
    }
}
