#![allow(dead_code)]

use odefit::prelude::models::{FreeFall, Sir};
use odefit::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

pub const MASS: f64 = 2.0;
pub const GAMMA: f64 = 0.4;
pub const G: f64 = 9.8;

pub fn options() -> SolverOptions {
    SolverOptions::default().with_tolerances(1e-6, 1e-6)
}

pub fn grid(start: f64, stop: f64, step: f64) -> Vec<f64> {
    let n = ((stop - start) / step).round() as usize;
    (0..=n).map(|i| start + i as f64 * step).collect()
}

pub fn free_fall_problem(times: &[f64]) -> OdeProblem<FreeFall> {
    OdeProblem::builder(FreeFall::new(MASS))
        .times(times)
        .options(options())
        .build()
        .expect("free-fall problem")
}

/// Exact free-fall velocities from rest, plus Gaussian noise
pub fn free_fall_data(times: &[f64], sigma: f64, seed: u64) -> Observations {
    let field = FreeFall::new(MASS);
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, sigma).expect("noise distribution");
    let values: Vec<f64> = times
        .iter()
        .map(|&t| field.solution(0.0, GAMMA, G, t) + noise.sample(&mut rng))
        .collect();
    Observations::builder()
        .column("velocity")
        .series(times, &values)
        .build()
        .expect("free-fall observations")
}

pub fn sir_problem(times: &[f64]) -> OdeProblem<Sir> {
    OdeProblem::builder(Sir)
        .times(times)
        .options(options())
        .build()
        .expect("SIR problem")
}

/// SIR fractions with multiplicative log-normal noise
pub fn sir_data(
    problem: &OdeProblem<Sir>,
    beta: f64,
    gamma: f64,
    y0: &[f64],
    sigma: f64,
    seed: u64,
) -> Observations {
    let traj = problem.simulate(y0, &[beta, gamma]).expect("SIR solve");
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, sigma).expect("noise distribution");
    let mut builder = Observations::builder().column("S").column("I");
    for (i, &t) in problem.times().iter().enumerate() {
        let row: Vec<f64> = (0..2)
            .map(|k| traj.value(i, k) * noise.sample(&mut rng).exp())
            .collect();
        builder = builder.row(t, &row);
    }
    builder.build().expect("SIR observations")
}

/// Route library logs to the test harness; `RUST_LOG=odefit=debug` shows them
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
