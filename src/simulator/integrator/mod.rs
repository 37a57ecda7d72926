//! Integration of the state jointly with its forward sensitivities.
//!
//! The sensitivity matrix `S = dy/d(theta, y0)` is `nstates x (ntheta + nstates)`
//! and obeys `dS/dt = J_y S + [J_p | 0]` with `S(t0) = [0 | I]`. diffsol
//! integrates it through its forward sensitivity equations, with the
//! concatenation `[theta, y0]` playing the role of the problem parameters.
use std::cell::RefCell;

use diffsol::error::{DiffsolError, OdeSolverError};
use diffsol::{
    NalgebraLU, NalgebraMat, NalgebraVec, OdeBuilder, OdeEquations, OdeSolverMethod,
    OdeSolverStopReason, Vector, VectorCommon,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ConfigError;
use crate::simulator::field::VectorField;
use crate::simulator::{M, T, V};

type DV = NalgebraVec<f64>;
type DM = NalgebraMat<f64>;

/// Integration scheme
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    /// [Method::Bdf] when the field reports [VectorField::is_stiff], [Method::Tsit45] otherwise
    #[default]
    Auto,
    /// Explicit Tsitouras 5(4) Runge-Kutta
    Tsit45,
    /// Variable-order BDF with a dense LU Newton solver
    Bdf,
}

/// Tolerances and limits for the integrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub method: Method,
    pub rtol: f64,
    pub atol: f64,
    /// Accepted steps allowed over the whole time span
    pub max_steps: usize,
    /// Include the sensitivity components in the local error estimate
    pub sensitivity_error_control: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            method: Method::Auto,
            rtol: 1e-8,
            atol: 1e-8,
            max_steps: 100_000,
            sensitivity_error_control: true,
        }
    }
}

impl SolverOptions {
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.rtol = rtol;
        self.atol = atol;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rtol.is_finite() || self.rtol <= 0.0 {
            return Err(ConfigError::invalid("rtol", "must be finite and > 0"));
        }
        if !self.atol.is_finite() || self.atol <= 0.0 {
            return Err(ConfigError::invalid("atol", "must be finite and > 0"));
        }
        if self.max_steps == 0 {
            return Err(ConfigError::invalid("max_steps", "must be > 0"));
        }
        Ok(())
    }
}

/// Failures of a single integration. They depend on the parameters being
/// integrated, so a sampler treats them as a rejected proposal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegrationError {
    #[error("step size became too small at t = {t}")]
    StepSizeTooSmall { t: f64 },
    #[error("too many error test failures at t = {t}")]
    ErrorTestFailures { t: f64 },
    #[error("exceeded {max_steps} steps at t = {t}")]
    MaxStepsExceeded { t: f64, max_steps: usize },
    #[error("non-finite state at t = {t}")]
    NonFinite { t: f64 },
    #[error("solver failed at t = {t}: {reason}")]
    Solver { t: f64, reason: String },
}

impl IntegrationError {
    fn from_diffsol(err: DiffsolError, t: T) -> Self {
        match err {
            DiffsolError::OdeSolverError(OdeSolverError::StepSizeTooSmall { time }) => {
                IntegrationError::StepSizeTooSmall { t: time }
            }
            DiffsolError::OdeSolverError(OdeSolverError::TooManyErrorTestFailures { time }) => {
                IntegrationError::ErrorTestFailures { t: time }
            }
            other => IntegrationError::Solver {
                t,
                reason: other.to_string(),
            },
        }
    }
}

/// States and, when requested, sensitivities at every output time
pub(crate) struct Solution {
    /// `n_times x nstates`
    pub states: M,
    /// One `nstates x (ntheta + nstates)` matrix per output time
    pub sensitivities: Option<Vec<M>>,
}

impl Solution {
    fn new(n_times: usize, n: usize, with_sensitivities: bool) -> Self {
        Solution {
            states: M::zeros(n_times, n),
            sensitivities: with_sensitivities.then(|| Vec::with_capacity(n_times)),
        }
    }

    /// `y0` with the seed `[0 | I]`
    fn record_initial(&mut self, i: usize, y0: &V, np: usize) {
        let n = y0.len();
        self.states.row_mut(i).copy_from(&y0.transpose());
        if let Some(sens) = self.sensitivities.as_mut() {
            let mut s = M::zeros(n, np + n);
            s.view_mut((0, np), (n, n)).fill_with_identity();
            sens.push(s);
        }
    }

    fn record(&mut self, i: usize, t: T, y: &V, s: &[DV]) -> Result<(), IntegrationError> {
        if y.iter().any(|v| !v.is_finite()) {
            return Err(IntegrationError::NonFinite { t });
        }
        self.states.row_mut(i).copy_from(&y.transpose());
        if let Some(sens) = self.sensitivities.as_mut() {
            let mut m = M::zeros(y.len(), s.len());
            for (j, column) in s.iter().enumerate() {
                m.column_mut(j).copy_from(column.inner());
            }
            if m.iter().any(|v| !v.is_finite()) {
                return Err(IntegrationError::NonFinite { t });
            }
            sens.push(m);
        }
        Ok(())
    }
}

/// Integrate `field` from `(t0, y0)` and record the solution at `times`.
///
/// `times` must be sorted and not precede `t0`; entries equal to `t0` get
/// the initial condition. `method` must already be resolved from
/// [Method::Auto].
#[allow(clippy::too_many_arguments)]
pub(crate) fn integrate<F>(
    field: &F,
    y0: &V,
    theta: &V,
    t0: T,
    times: &[T],
    method: Method,
    opts: &SolverOptions,
    with_sensitivities: bool,
) -> Result<Solution, IntegrationError>
where
    F: VectorField + ?Sized,
{
    let n = y0.len();
    let np = theta.len();
    let mut solution = Solution::new(times.len(), n, with_sensitivities);
    let start = times.iter().take_while(|&&t| t <= t0).count();
    for i in 0..start {
        solution.record_initial(i, y0, np);
    }
    if start == times.len() {
        return Ok(solution);
    }

    let jy = RefCell::new(M::zeros(n, n));
    let jp = RefCell::new(M::zeros(n, np));

    // theta is fixed for the whole solve; diffsol's copy only drives the
    // sensitivity seeding
    let rhs = |x: &DV, _p: &DV, t: T, dy: &mut DV| {
        field.evaluate(x.inner(), t, theta, dy.inner_mut());
    };
    let rhs_jac = |x: &DV, _p: &DV, t: T, v: &DV, jv: &mut DV| {
        let mut jac = jy.borrow_mut();
        jac.fill(0.0);
        field.jacobian_state(x.inner(), t, theta, &mut *jac);
        jv.inner_mut().gemv(1.0, &*jac, v.inner(), 0.0);
    };
    let rhs_sens = |x: &DV, _p: &DV, t: T, v: &DV, sv: &mut DV| {
        let out = sv.inner_mut();
        out.fill(0.0);
        if np == 0 {
            return;
        }
        let mut jac = jp.borrow_mut();
        jac.fill(0.0);
        field.jacobian_params(x.inner(), t, theta, &mut *jac);
        out.gemv(1.0, &*jac, &v.inner().rows(0, np), 0.0);
    };
    let init = |p: &DV, _t: T, y: &mut DV| {
        y.inner_mut().copy_from(&p.inner().rows(np, n));
    };
    let init_sens = |_p: &DV, _t: T, v: &DV, y: &mut DV| {
        y.inner_mut().copy_from(&v.inner().rows(np, n));
    };

    let mut builder = OdeBuilder::<DM>::new()
        .t0(t0)
        .rtol(opts.rtol)
        .atol([opts.atol])
        .sens_rtol(opts.rtol)
        .sens_atol([opts.atol])
        .p(theta.iter().chain(y0.iter()).copied());
    if !opts.sensitivity_error_control {
        builder = builder.turn_off_sensitivities_error_control();
    }
    let problem = builder
        .rhs_sens_implicit(rhs, rhs_jac, rhs_sens)
        .init_sens(init, init_sens, n)
        .build()
        .map_err(|e| IntegrationError::from_diffsol(e, t0))?;

    let rest = &times[start..];
    let solver_error = |e| IntegrationError::from_diffsol(e, t0);
    match (method, with_sensitivities) {
        (Method::Bdf, true) => {
            let mut solver = problem.bdf_sens::<NalgebraLU<f64>>().map_err(solver_error)?;
            drive(&mut solver, rest, start, opts.max_steps, &mut solution)?;
        }
        (Method::Bdf, false) => {
            let mut solver = problem.bdf::<NalgebraLU<f64>>().map_err(solver_error)?;
            drive(&mut solver, rest, start, opts.max_steps, &mut solution)?;
        }
        (_, true) => {
            let mut solver = problem.tsit45_sens().map_err(solver_error)?;
            drive(&mut solver, rest, start, opts.max_steps, &mut solution)?;
        }
        (_, false) => {
            let mut solver = problem.tsit45().map_err(solver_error)?;
            drive(&mut solver, rest, start, opts.max_steps, &mut solution)?;
        }
    }
    Ok(solution)
}

/// Step to each output time in turn, stopping exactly on it
fn drive<'a, Eqn, S>(
    solver: &mut S,
    times: &[T],
    offset: usize,
    max_steps: usize,
    solution: &mut Solution,
) -> Result<(), IntegrationError>
where
    Eqn: OdeEquations<T = f64, V = DV, M = DM> + 'a,
    S: OdeSolverMethod<'a, Eqn>,
{
    let mut steps = 0;
    for (i, &t) in times.iter().enumerate() {
        match solver.set_stop_time(t) {
            Ok(()) => loop {
                if steps >= max_steps {
                    return Err(IntegrationError::MaxStepsExceeded {
                        t: solver.state().t,
                        max_steps,
                    });
                }
                steps += 1;
                match solver.step() {
                    Ok(OdeSolverStopReason::TstopReached) => break,
                    Ok(_) => {}
                    Err(e) => return Err(IntegrationError::from_diffsol(e, solver.state().t)),
                }
            },
            // The previous step already landed on t
            Err(DiffsolError::OdeSolverError(OdeSolverError::StopTimeAtCurrentTime)) => {}
            Err(e) => return Err(IntegrationError::from_diffsol(e, solver.state().t)),
        }
        let state = solver.state();
        solution.record(offset + i, t, state.y.inner(), state.s)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::field::models::FreeFall;
    use approx::assert_relative_eq;

    fn free_fall(method: Method, times: &[T], with_sensitivities: bool) -> Solution {
        let field = FreeFall::new(2.0);
        let opts = SolverOptions::default().with_tolerances(1e-9, 1e-9);
        integrate(
            &field,
            &V::from_vec(vec![1.0]),
            &V::from_vec(vec![0.4, 9.8]),
            0.0,
            times,
            method,
            &opts,
            with_sensitivities,
        )
        .unwrap()
    }

    #[test]
    fn both_methods_hit_the_closed_form() {
        let field = FreeFall::new(2.0);
        let times: [T; 3] = [0.5, 1.0, 4.0];
        for method in [Method::Tsit45, Method::Bdf] {
            let solution = free_fall(method, &times, true);
            for (i, &t) in times.iter().enumerate() {
                let exact = field.solution(1.0, 0.4, 9.8, t);
                assert_relative_eq!(solution.states[(i, 0)], exact, max_relative = 1e-6);
                let s = &solution.sensitivities.as_ref().unwrap()[i];
                assert_relative_eq!(s[(0, 2)], (-0.2 * t).exp(), max_relative = 1e-6);
            }
        }
    }

    #[test]
    fn outputs_at_t0_carry_the_seed() {
        let solution = free_fall(Method::Tsit45, &[0.0, 1.0], true);
        assert_eq!(solution.states[(0, 0)], 1.0);
        let s = &solution.sensitivities.unwrap()[0];
        assert_eq!(s, &M::from_row_slice(1, 3, &[0.0, 0.0, 1.0]));
    }

    #[test]
    fn states_only_skip_sensitivities() {
        let solution = free_fall(Method::Bdf, &[1.0, 2.0], false);
        assert!(solution.sensitivities.is_none());
    }

    #[test]
    fn step_budget_is_enforced() {
        let field = FreeFall::new(2.0);
        let opts = SolverOptions::default().with_max_steps(2);
        let err = integrate(
            &field,
            &V::from_vec(vec![0.0]),
            &V::from_vec(vec![0.4, 9.8]),
            0.0,
            &[100.0],
            Method::Tsit45,
            &opts,
            true,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            IntegrationError::MaxStepsExceeded { max_steps: 2, .. }
        ));
    }

    #[test]
    fn options_are_validated() {
        assert!(SolverOptions::default().validate().is_ok());
        assert!(SolverOptions::default()
            .with_tolerances(0.0, 1e-6)
            .validate()
            .is_err());
        assert!(SolverOptions::default()
            .with_tolerances(1e-6, f64::NAN)
            .validate()
            .is_err());
        assert!(SolverOptions::default().with_max_steps(0).validate().is_err());
    }
}
