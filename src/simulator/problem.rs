use std::panic::{self, AssertUnwindSafe};

use crate::data::observation::validate_times;
use crate::error::{ConfigError, OdeFitError};
use crate::simulator::field::VectorField;
use crate::simulator::integrator::{integrate, IntegrationError, Method, SolverOptions};
use crate::simulator::trajectory::Trajectory;
use crate::simulator::{M, T, V};

/// A vector field together with an initial time, output times and solver
/// options. Building validates every dimension once; solving is then pure
/// and can be repeated with different parameters and initial states.
#[derive(Debug, Clone)]
pub struct OdeProblem<F: VectorField> {
    field: F,
    t0: T,
    times: Vec<T>,
    n_states: usize,
    n_theta: usize,
    options: SolverOptions,
}

pub struct OdeProblemBuilder<F: VectorField> {
    field: F,
    t0: T,
    times: Vec<T>,
    n_states: Option<usize>,
    n_theta: Option<usize>,
    options: SolverOptions,
}

impl<F: VectorField> OdeProblemBuilder<F> {
    pub fn t0(mut self, t0: T) -> Self {
        self.t0 = t0;
        self
    }

    pub fn times(mut self, times: &[T]) -> Self {
        self.times = times.to_vec();
        self
    }

    /// Declared number of states, checked against the field
    pub fn n_states(mut self, n: usize) -> Self {
        self.n_states = Some(n);
        self
    }

    /// Declared number of parameters, checked against the field
    pub fn n_theta(mut self, n: usize) -> Self {
        self.n_theta = Some(n);
        self
    }

    pub fn options(mut self, options: SolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<OdeProblem<F>, ConfigError> {
        self.options.validate()?;
        if !self.t0.is_finite() {
            return Err(ConfigError::invalid("t0", "must be finite"));
        }
        validate_times(&self.times)?;
        if self.times[0] < self.t0 {
            return Err(ConfigError::TimeBeforeStart {
                time: self.times[0],
                t0: self.t0,
            });
        }

        let n_states = self.field.nstates();
        let n_theta = self.field.nparams();
        if let Some(declared) = self.n_states {
            if declared != n_states {
                return Err(ConfigError::mismatch("n_states", declared, n_states));
            }
        }
        if let Some(declared) = self.n_theta {
            if declared != n_theta {
                return Err(ConfigError::mismatch("n_theta", declared, n_theta));
            }
        }
        if n_states == 0 {
            return Err(ConfigError::invalid("n_states", "must be > 0"));
        }
        check_shapes(&self.field, self.t0, n_states, n_theta)?;

        Ok(OdeProblem {
            field: self.field,
            t0: self.t0,
            times: self.times,
            n_states,
            n_theta,
            options: self.options,
        })
    }
}

/// Room added to a buffer when a field wrote past its declared size, so the
/// size it actually uses can be reported
const OVERFLOW_SLACK: usize = 16;

fn guarded<R>(f: impl FnOnce() -> R) -> Option<R> {
    panic::catch_unwind(AssertUnwindSafe(f)).ok()
}

/// Rows and columns holding at least one written (non-NaN) entry
fn written_extent(m: &M) -> (usize, usize) {
    let mut extent = (0, 0);
    for j in 0..m.ncols() {
        for i in 0..m.nrows() {
            if !m[(i, j)].is_nan() {
                extent = (extent.0.max(i + 1), extent.1.max(j + 1));
            }
        }
    }
    extent
}

/// Repeat a Jacobian evaluation that panicked on an oversized matrix and
/// report the shape it wrote
fn jacobian_overflow(what: &str, shape: (usize, usize), fill: impl FnOnce(&mut M)) -> ConfigError {
    let (rows, cols) = shape;
    let mut wide = M::from_element(rows + OVERFLOW_SLACK, cols + OVERFLOW_SLACK, f64::NAN);
    match guarded(|| fill(&mut wide)) {
        Some(()) => {
            let (r, c) = written_extent(&wide);
            if c != cols {
                ConfigError::mismatch(format!("{what} columns"), cols, c)
            } else {
                ConfigError::mismatch(format!("{what} rows"), rows, r)
            }
        }
        None => ConfigError::invalid(what, "panicked during evaluation"),
    }
}

/// Evaluate the field and its Jacobians once and check every output shape.
///
/// A field that indexes past its declared sizes panics; the panic is caught
/// and turned into a dimension mismatch.
fn check_shapes<F: VectorField>(field: &F, t0: T, n: usize, np: usize) -> Result<(), ConfigError> {
    let y = V::from_element(n, 0.5);
    let p = V::from_element(np, 0.5);

    let mut dy = V::zeros(n);
    if guarded(|| field.evaluate(&y, t0, &p, &mut dy)).is_none() {
        let mut wide = V::from_element(n + OVERFLOW_SLACK, f64::NAN);
        return Err(match guarded(|| field.evaluate(&y, t0, &p, &mut wide)) {
            Some(()) => {
                let got = wide.iter().rposition(|v| !v.is_nan()).map_or(0, |i| i + 1);
                ConfigError::mismatch("vector field output", n, got)
            }
            None => ConfigError::invalid("vector field", "panicked during evaluation"),
        });
    }
    if dy.len() != n {
        return Err(ConfigError::mismatch("vector field output", n, dy.len()));
    }

    let mut jy = M::zeros(n, n);
    if guarded(|| field.jacobian_state(&y, t0, &p, &mut jy)).is_none() {
        return Err(jacobian_overflow("state Jacobian", (n, n), |m| {
            field.jacobian_state(&y, t0, &p, m)
        }));
    }
    if jy.shape() != (n, n) {
        return Err(ConfigError::mismatch(
            "state Jacobian columns",
            n,
            jy.ncols(),
        ));
    }

    let mut jp = M::zeros(n, np);
    if guarded(|| field.jacobian_params(&y, t0, &p, &mut jp)).is_none() {
        return Err(jacobian_overflow("parameter Jacobian", (n, np), |m| {
            field.jacobian_params(&y, t0, &p, m)
        }));
    }
    if jp.shape() != (n, np) {
        return Err(ConfigError::mismatch(
            "parameter Jacobian columns",
            np,
            jp.ncols(),
        ));
    }
    Ok(())
}

impl<F: VectorField> OdeProblem<F> {
    pub fn builder(field: F) -> OdeProblemBuilder<F> {
        OdeProblemBuilder {
            field,
            t0: 0.0,
            times: Vec::new(),
            n_states: None,
            n_theta: None,
            options: SolverOptions::default(),
        }
    }

    pub fn field(&self) -> &F {
        &self.field
    }

    pub fn t0(&self) -> T {
        self.t0
    }

    pub fn times(&self) -> &[T] {
        &self.times
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn n_theta(&self) -> usize {
        self.n_theta
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// The scheme used when solving, after resolving [Method::Auto]
    pub fn method(&self) -> Method {
        match self.options.method {
            Method::Auto if self.field.is_stiff() => Method::Bdf,
            Method::Auto => Method::Tsit45,
            other => other,
        }
    }

    /// States and sensitivities `[dy/dtheta | dy/dy0]` at every output time
    pub fn solve(&self, y0: &[f64], theta: &[f64]) -> Result<Trajectory, OdeFitError> {
        self.run(y0, theta, true)
    }

    /// States only
    pub fn simulate(&self, y0: &[f64], theta: &[f64]) -> Result<Trajectory, OdeFitError> {
        self.run(y0, theta, false)
    }

    fn run(
        &self,
        y0: &[f64],
        theta: &[f64],
        with_sensitivities: bool,
    ) -> Result<Trajectory, OdeFitError> {
        if y0.len() != self.n_states {
            return Err(ConfigError::mismatch("y0", self.n_states, y0.len()).into());
        }
        if theta.len() != self.n_theta {
            return Err(ConfigError::mismatch("theta", self.n_theta, theta.len()).into());
        }

        let y0 = V::from_column_slice(y0);
        let p = V::from_column_slice(theta);
        let solution = integrate(
            &self.field,
            &y0,
            &p,
            self.t0,
            &self.times,
            self.method(),
            &self.options,
            with_sensitivities,
        )
        .map_err(|e: IntegrationError| {
            tracing::debug!(error = %e, ?theta, "integration failed");
            e
        })?;

        Ok(Trajectory::new(
            self.times.clone(),
            solution.states,
            solution.sensitivities,
            self.n_theta,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::field::closure::ClosureField;
    use crate::simulator::field::models::{FreeFall, Sir};
    use approx::assert_relative_eq;

    #[test]
    fn rejects_times_before_t0() {
        let err = OdeProblem::builder(FreeFall::default())
            .t0(1.0)
            .times(&[0.5, 2.0])
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::TimeBeforeStart { time: 0.5, t0: 1.0 });
    }

    #[test]
    fn rejects_declared_dimension_mismatch() {
        let err = OdeProblem::builder(Sir)
            .times(&[1.0])
            .n_states(3)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DimensionMismatch { .. }));
        let err = OdeProblem::builder(Sir)
            .times(&[1.0])
            .n_theta(1)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DimensionMismatch { .. }));
    }

    #[test]
    fn field_writing_extra_outputs_is_a_dimension_mismatch() {
        fn rhs(y: &V, _t: T, _p: &V, dy: &mut V) {
            dy[0] = -y[0];
            dy[1] = y[0];
        }
        let err = OdeProblem::builder(ClosureField::new(1, 0, rhs))
            .times(&[1.0])
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::mismatch("vector field output", 1, 2));
    }

    #[test]
    fn oversized_parameter_jacobian_is_a_dimension_mismatch() {
        fn rhs(y: &V, _t: T, p: &V, dy: &mut V) {
            dy[0] = -p[0] * y[0];
        }
        fn jacobian(y: &V, _t: T, _p: &V, jac: &mut M) {
            jac[(0, 0)] = -y[0];
            jac[(0, 1)] = 0.0;
        }
        let field = ClosureField::new(1, 1, rhs).with_param_jacobian(jacobian);
        let err = OdeProblem::builder(field)
            .times(&[1.0])
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::mismatch("parameter Jacobian columns", 1, 2)
        );
    }

    #[test]
    fn rejects_empty_times() {
        let err = OdeProblem::builder(Sir).build().unwrap_err();
        assert_eq!(err, ConfigError::EmptyTimes);
    }

    #[test]
    fn wrong_argument_lengths_are_config_errors() {
        let problem = OdeProblem::builder(Sir).times(&[1.0]).build().unwrap();
        let err = problem.solve(&[0.99], &[4.0, 1.0]).unwrap_err();
        assert!(!err.is_recoverable());
        let err = problem.solve(&[0.99, 0.01], &[4.0]).unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn output_at_t0_is_the_initial_condition() {
        let problem = OdeProblem::builder(FreeFall::default())
            .times(&[0.0, 1.0])
            .build()
            .unwrap();
        let traj = problem.solve(&[-2.0], &[0.4, 9.8]).unwrap();
        assert_eq!(traj.value(0, 0), -2.0);
        assert_eq!(traj.dtheta(0).unwrap(), M::zeros(1, 2));
        assert_eq!(traj.dy0(0).unwrap(), M::identity(1, 1));
    }

    #[test]
    fn simulate_skips_sensitivities() {
        let problem = OdeProblem::builder(FreeFall::default())
            .times(&[1.0, 2.0])
            .build()
            .unwrap();
        let traj = problem.simulate(&[0.0], &[0.4, 9.8]).unwrap();
        assert!(!traj.has_sensitivities());
        let full = problem.solve(&[0.0], &[0.4, 9.8]).unwrap();
        assert_relative_eq!(traj.value(1, 0), full.value(1, 0), epsilon = 1e-7);
    }

    #[test]
    fn auto_method_follows_stiffness() {
        fn rhs(y: &V, _t: T, p: &V, dy: &mut V) {
            dy[0] = -p[0] * y[0];
        }
        let stiff = OdeProblem::builder(ClosureField::new(1, 1, rhs).stiff(true))
            .times(&[1.0])
            .build()
            .unwrap();
        assert_eq!(stiff.method(), Method::Bdf);
        let explicit = OdeProblem::builder(ClosureField::new(1, 1, rhs))
            .times(&[1.0])
            .build()
            .unwrap();
        assert_eq!(explicit.method(), Method::Tsit45);
    }

    #[test]
    fn blow_up_is_a_recoverable_failure() {
        // y' = y^2 explodes at t = 1 for y0 = 1
        fn rhs(y: &V, _t: T, _p: &V, dy: &mut V) {
            dy[0] = y[0] * y[0];
        }
        let problem = OdeProblem::builder(ClosureField::new(1, 0, rhs))
            .times(&[0.5, 2.0])
            .options(SolverOptions::default().with_max_steps(5_000))
            .build()
            .unwrap();
        let err = problem.solve(&[1.0], &[]).unwrap_err();
        assert!(err.is_recoverable());
    }
}
