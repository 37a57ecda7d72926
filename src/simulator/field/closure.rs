use crate::simulator::field::VectorField;
use crate::simulator::{M, T, V};

/// This function pointer represents the differential equation of the model:
/// Params:
/// - y: The state vector at time t
/// - t: The time at which the derivative is evaluated
/// - p: The parameters of the model; use the [crate::fetch_params!] macro to extract them
/// - dy: A mutable reference to the derivative of the state vector at time t
///
/// Example:
/// ```
/// use odefit::fetch_params;
/// use odefit::prelude::simulator::{Rhs, V};
///
/// let logistic: Rhs = |y, _t, p, dy| {
///     fetch_params!(p, r, k);
///     dy[0] = r * y[0] * (1.0 - y[0] / k);
/// };
///
/// let mut dy = V::zeros(1);
/// logistic(&V::from_vec(vec![5.0]), 0.0, &V::from_vec(vec![0.5, 10.0]), &mut dy);
/// assert_eq!(dy[0], 1.25);
/// ```
pub type Rhs = fn(&V, T, &V, &mut V);

/// Analytic Jacobian of a [Rhs], either with respect to the states or the
/// parameters. The matrix is pre-sized and zeroed.
pub type Jacobian = fn(&V, T, &V, &mut M);

/// A [VectorField] assembled from plain functions
///
/// Jacobians that are not supplied fall back to finite differences.
#[derive(Clone, Debug)]
pub struct ClosureField {
    nstates: usize,
    nparams: usize,
    rhs: Rhs,
    jacobian_state: Option<Jacobian>,
    jacobian_params: Option<Jacobian>,
    stiff: bool,
}

impl ClosureField {
    pub fn new(nstates: usize, nparams: usize, rhs: Rhs) -> Self {
        ClosureField {
            nstates,
            nparams,
            rhs,
            jacobian_state: None,
            jacobian_params: None,
            stiff: false,
        }
    }

    pub fn with_state_jacobian(mut self, jacobian: Jacobian) -> Self {
        self.jacobian_state = Some(jacobian);
        self
    }

    pub fn with_param_jacobian(mut self, jacobian: Jacobian) -> Self {
        self.jacobian_params = Some(jacobian);
        self
    }

    /// Mark the system as stiff so that automatic method selection uses the
    /// implicit integrator
    pub fn stiff(mut self, stiff: bool) -> Self {
        self.stiff = stiff;
        self
    }
}

impl VectorField for ClosureField {
    fn nstates(&self) -> usize {
        self.nstates
    }

    fn nparams(&self) -> usize {
        self.nparams
    }

    fn evaluate(&self, y: &V, t: T, p: &V, dy: &mut V) {
        (self.rhs)(y, t, p, dy)
    }

    fn jacobian_state(&self, y: &V, t: T, p: &V, jac: &mut M) {
        match self.jacobian_state {
            Some(j) => j(y, t, p, jac),
            None => Defaults(self).jacobian_state(y, t, p, jac),
        }
    }

    fn jacobian_params(&self, y: &V, t: T, p: &V, jac: &mut M) {
        match self.jacobian_params {
            Some(j) => j(y, t, p, jac),
            None => Defaults(self).jacobian_params(y, t, p, jac),
        }
    }

    fn is_stiff(&self) -> bool {
        self.stiff
    }
}

// Keeps the finite-difference trait defaults for missing Jacobians.
struct Defaults<'a>(&'a ClosureField);

impl VectorField for Defaults<'_> {
    fn nstates(&self) -> usize {
        self.0.nstates
    }
    fn nparams(&self) -> usize {
        self.0.nparams
    }
    fn evaluate(&self, y: &V, t: T, p: &V, dy: &mut V) {
        (self.0.rhs)(y, t, p, dy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn decay(y: &V, _t: T, p: &V, dy: &mut V) {
        dy[0] = -p[0] * y[0];
    }

    fn decay_jac_y(_y: &V, _t: T, p: &V, jac: &mut M) {
        jac[(0, 0)] = -p[0];
    }

    #[test]
    fn closure_field_uses_supplied_jacobian() {
        let field = ClosureField::new(1, 1, decay).with_state_jacobian(decay_jac_y);
        let y = V::from_vec(vec![2.0]);
        let p = V::from_vec(vec![0.5]);
        let mut dy = V::zeros(1);
        field.evaluate(&y, 0.0, &p, &mut dy);
        assert_eq!(dy[0], -1.0);

        let mut jy = M::zeros(1, 1);
        field.jacobian_state(&y, 0.0, &p, &mut jy);
        assert_eq!(jy[(0, 0)], -0.5);

        // No parameter Jacobian given: finite differences
        let mut jp = M::zeros(1, 1);
        field.jacobian_params(&y, 0.0, &p, &mut jp);
        assert_relative_eq!(jp[(0, 0)], -2.0, epsilon = 1e-8);
    }

    #[test]
    fn stiff_flag_is_reported() {
        assert!(ClosureField::new(1, 1, decay).stiff(true).is_stiff());
        assert!(!ClosureField::new(1, 1, decay).is_stiff());
    }
}
