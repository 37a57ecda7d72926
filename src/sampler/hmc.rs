//! Leapfrog integration in unconstrained space with a diagonal metric.

use std::cell::Cell;

use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::OdeFitError;
use crate::sampler::LogDensity;

/// Diagonal Euclidean metric, stored as the inverse mass matrix
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Metric {
    inv_mass: Vec<f64>,
}

impl Metric {
    pub(crate) fn identity(dim: usize) -> Self {
        Metric {
            inv_mass: vec![1.0; dim],
        }
    }

    /// The inverse mass is the estimated posterior variance
    pub(crate) fn from_variance(variance: Vec<f64>) -> Self {
        Metric { inv_mass: variance }
    }

    pub(crate) fn inv_mass(&self) -> &[f64] {
        &self.inv_mass
    }

    /// `M^{-1} p`
    pub(crate) fn velocity(&self, p: &[f64]) -> Vec<f64> {
        self.inv_mass.iter().zip(p).map(|(m, p)| m * p).collect()
    }

    pub(crate) fn kinetic_energy(&self, p: &[f64]) -> f64 {
        0.5 * self
            .inv_mass
            .iter()
            .zip(p)
            .map(|(m, p)| m * p * p)
            .sum::<f64>()
    }

    /// `p ~ N(0, M)`
    pub(crate) fn sample_momentum<R: Rng>(&self, rng: &mut R) -> Vec<f64> {
        self.inv_mass
            .iter()
            .map(|m| {
                let z: f64 = rng.sample(StandardNormal);
                z / m.sqrt()
            })
            .collect()
    }
}

/// Position, momentum and the cached potential `-log p(q)` with its gradient
#[derive(Debug, Clone)]
pub(crate) struct PhaseState {
    pub q: Vec<f64>,
    pub p: Vec<f64>,
    pub potential: f64,
    pub grad_potential: Vec<f64>,
}

impl PhaseState {
    pub(crate) fn hamiltonian(&self, metric: &Metric) -> f64 {
        self.potential + metric.kinetic_energy(&self.p)
    }

    pub(crate) fn log_density(&self) -> f64 {
        -self.potential
    }
}

/// Leapfrog integrator bound to one density, step size and metric
///
/// Evaluations that fail for the proposed parameters (an integration or
/// likelihood failure) are treated as an infinite potential and counted.
pub(crate) struct Leapfrog<'a, D: LogDensity + ?Sized> {
    density: &'a D,
    step_size: f64,
    metric: Metric,
    rejected: Cell<usize>,
}

impl<'a, D: LogDensity + ?Sized> Leapfrog<'a, D> {
    pub(crate) fn new(density: &'a D, step_size: f64, metric: Metric) -> Self {
        Leapfrog {
            density,
            step_size,
            metric,
            rejected: Cell::new(0),
        }
    }

    pub(crate) fn metric(&self) -> &Metric {
        &self.metric
    }

    /// Failed evaluations so far
    pub(crate) fn rejected(&self) -> usize {
        self.rejected.get()
    }

    /// Potential and its gradient at `q`
    pub(crate) fn potential(&self, q: &[f64]) -> Result<(f64, Vec<f64>), OdeFitError> {
        let mut grad = vec![0.0; q.len()];
        match self.density.logp_and_grad(q, &mut grad) {
            Ok(lp) if lp.is_nan() || grad.iter().any(|g| !g.is_finite()) => {
                tracing::debug!(?q, "non-finite log density or gradient");
                self.rejected.set(self.rejected.get() + 1);
                Ok((f64::INFINITY, vec![0.0; q.len()]))
            }
            Ok(lp) => {
                grad.iter_mut().for_each(|g| *g = -*g);
                Ok((-lp, grad))
            }
            Err(e) if e.is_recoverable() => {
                tracing::debug!(error = %e, "proposal rejected");
                self.rejected.set(self.rejected.get() + 1);
                Ok((f64::INFINITY, vec![0.0; q.len()]))
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn init_state(&self, q: Vec<f64>) -> Result<PhaseState, OdeFitError> {
        let (potential, grad_potential) = self.potential(&q)?;
        Ok(PhaseState {
            p: vec![0.0; q.len()],
            q,
            potential,
            grad_potential,
        })
    }

    /// One step of size `direction * step_size`
    pub(crate) fn step(&self, state: &mut PhaseState, direction: f64) -> Result<(), OdeFitError> {
        let eps = direction * self.step_size;
        for (p, g) in state.p.iter_mut().zip(&state.grad_potential) {
            *p -= 0.5 * eps * g;
        }
        let v = self.metric.velocity(&state.p);
        for (q, v) in state.q.iter_mut().zip(&v) {
            *q += eps * v;
        }
        let (potential, grad) = self.potential(&state.q)?;
        state.potential = potential;
        state.grad_potential = grad;
        for (p, g) in state.p.iter_mut().zip(&state.grad_potential) {
            *p -= 0.5 * eps * g;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::tests::StdNormal;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn leapfrog_is_reversible() {
        let density = StdNormal::new(3);
        let leapfrog = Leapfrog::new(&density, 0.1, Metric::identity(3));
        let mut state = leapfrog.init_state(vec![0.5, -1.0, 2.0]).unwrap();
        state.p = vec![0.3, 0.1, -0.7];
        let start = state.clone();
        for _ in 0..10 {
            leapfrog.step(&mut state, 1.0).unwrap();
        }
        for _ in 0..10 {
            leapfrog.step(&mut state, -1.0).unwrap();
        }
        for (a, b) in state.q.iter().zip(&start.q) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn energy_is_nearly_conserved() {
        let density = StdNormal::new(2);
        let leapfrog = Leapfrog::new(&density, 0.05, Metric::identity(2));
        let mut state = leapfrog.init_state(vec![1.0, 0.0]).unwrap();
        state.p = vec![0.0, 1.0];
        let h0 = state.hamiltonian(leapfrog.metric());
        for _ in 0..100 {
            leapfrog.step(&mut state, 1.0).unwrap();
        }
        assert!((state.hamiltonian(leapfrog.metric()) - h0).abs() < 1e-3);
    }

    #[test]
    fn momentum_follows_the_mass_matrix() {
        let metric = Metric::from_variance(vec![4.0]);
        let mut rng = StdRng::seed_from_u64(3);
        let n = 20_000;
        let var = (0..n)
            .map(|_| metric.sample_momentum(&mut rng)[0].powi(2))
            .sum::<f64>()
            / n as f64;
        assert_relative_eq!(var, 0.25, epsilon = 0.02);
        assert_relative_eq!(metric.kinetic_energy(&[2.0]), 8.0);
    }
}
