mod common;

use approx::assert_relative_eq;
use common::*;
use odefit::prelude::models::FreeFall;
use odefit::prelude::simulator::{M, T, V};
use odefit::prelude::*;
use odefit::Method;

fn assert_matches_closed_form(method: Method) {
    let times = grid(0.5, 10.0, 0.5);
    let problem = OdeProblem::builder(FreeFall::new(MASS))
        .times(&times)
        .options(options().with_method(method))
        .build()
        .unwrap();
    let field = FreeFall::new(MASS);
    let traj = problem.simulate(&[1.5], &[GAMMA, G]).unwrap();

    assert_eq!(traj.n_times(), times.len());
    assert!(!traj.has_sensitivities());
    for (i, &t) in times.iter().enumerate() {
        let exact = field.solution(1.5, GAMMA, G, t);
        assert_relative_eq!(traj.value(i, 0), exact, max_relative = 1e-4);
    }
}

#[test]
fn explicit_solution_matches_closed_form() {
    assert_matches_closed_form(Method::Tsit45);
}

#[test]
fn implicit_solution_matches_closed_form() {
    assert_matches_closed_form(Method::Bdf);
}

#[test]
fn solving_is_deterministic() {
    let problem = free_fall_problem(&grid(1.0, 10.0, 1.0));
    let a = problem.solve(&[0.0], &[GAMMA, G]).unwrap();
    let b = problem.solve(&[0.0], &[GAMMA, G]).unwrap();
    assert_eq!(a, b);
}

#[test]
fn output_at_t0_is_the_initial_state() {
    let problem = free_fall_problem(&[0.0, 1.0]);
    let traj = problem.solve(&[3.0], &[GAMMA, G]).unwrap();
    assert_eq!(traj.value(0, 0), 3.0);
    let s = traj.sensitivity(0).unwrap();
    assert_eq!(s[(0, 0)], 0.0);
    assert_eq!(s[(0, 1)], 0.0);
    assert_eq!(s[(0, 2)], 1.0);
}

#[test]
fn observation_before_t0_is_rejected() {
    let err = OdeProblem::builder(FreeFall::new(MASS))
        .t0(1.0)
        .times(&[0.5, 2.0])
        .build()
        .unwrap_err();
    assert!(matches!(err, ConfigError::TimeBeforeStart { .. }));
}

#[test]
fn unordered_or_empty_times_are_rejected() {
    let err = OdeProblem::builder(FreeFall::new(MASS))
        .times(&[1.0, 1.0])
        .build()
        .unwrap_err();
    assert!(matches!(err, ConfigError::NonIncreasingTimes { .. }));

    let err = OdeProblem::builder(FreeFall::new(MASS)).build().unwrap_err();
    assert!(matches!(err, ConfigError::EmptyTimes));
}

#[test]
fn declared_dimensions_must_match_the_field() {
    let err = OdeProblem::builder(FreeFall::new(MASS))
        .times(&[1.0])
        .n_theta(3)
        .build()
        .unwrap_err();
    assert!(matches!(err, ConfigError::DimensionMismatch { .. }));

    let problem = free_fall_problem(&[1.0]);
    let err = problem.solve(&[0.0, 0.0], &[GAMMA, G]).unwrap_err();
    assert!(!err.is_recoverable());
}

fn decay(y: &V, _t: T, _p: &V, dy: &mut V) {
    dy[0] = -0.5 * y[0];
}

fn decay_jacobian(_y: &V, _t: T, _p: &V, jac: &mut M) {
    jac[(0, 0)] = -0.5;
}

#[test]
fn parameter_free_models_integrate() {
    let field = ClosureField::new(1, 0, decay).with_state_jacobian(decay_jacobian);
    let problem = OdeProblem::builder(field)
        .times(&[1.0, 2.0])
        .options(options())
        .build()
        .unwrap();
    let traj = problem.solve(&[2.0], &[]).unwrap();

    assert_relative_eq!(traj.value(1, 0), 2.0 * (-1.0f64).exp(), max_relative = 1e-5);
    let dtheta = traj.dtheta(1).unwrap();
    assert_eq!(dtheta.shape(), (1, 0));
    let dy0 = traj.dy0(1).unwrap();
    assert_relative_eq!(dy0[(0, 0)], (-1.0f64).exp(), max_relative = 1e-5);
}

#[test]
fn exhausted_step_budget_is_recoverable() {
    let problem = OdeProblem::builder(FreeFall::new(MASS))
        .times(&[50.0])
        .options(options().with_max_steps(3))
        .build()
        .unwrap();
    let err = problem.solve(&[0.0], &[GAMMA, G]).unwrap_err();
    assert!(err.is_recoverable());
}
