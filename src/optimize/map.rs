use argmin::{
    core::{CostFunction, Error, Executor},
    solver::neldermead::NelderMead,
};

use crate::error::OdeFitError;
use crate::sampler::LogDensity;

/// Iteration cap of the MAP search used for chain initialization
pub const MAX_MAP_ITERS: u64 = 2_000;

/// Cost of a point where the density could not be evaluated
const PENALTY: f64 = 1e300;

/// Maximum a posteriori point, in both parameterizations
#[derive(Debug, Clone, PartialEq)]
pub struct MapEstimate {
    pub z: Vec<f64>,
    pub x: Vec<f64>,
    pub log_density: f64,
    pub iterations: u64,
}

struct NegLogDensity<'a, D: LogDensity> {
    density: &'a D,
}

impl<D: LogDensity> CostFunction for NegLogDensity<'_, D> {
    type Param = Vec<f64>;
    type Output = f64;
    fn cost(&self, z: &Self::Param) -> Result<Self::Output, Error> {
        match self.density.logp(z) {
            Ok(lp) if lp.is_finite() => Ok(-lp),
            Ok(_) => Ok(PENALTY),
            Err(e) if e.is_recoverable() => Ok(PENALTY),
            Err(e) => Err(anyhow::Error::new(e).context("log density evaluation failed")),
        }
    }
}

/// Nelder-Mead on the negative log density in unconstrained space
pub fn find_map<D: LogDensity>(
    density: &D,
    start: &[f64],
    max_iters: u64,
) -> Result<MapEstimate, OdeFitError> {
    let simplex = create_initial_simplex(start);
    let solver: NelderMead<Vec<f64>, f64> = NelderMead::new(simplex)
        .with_sd_tolerance(1e-10)
        .map_err(|e| OdeFitError::Optimization(e.to_string()))?;
    let res = Executor::new(NegLogDensity { density }, solver)
        .configure(|state| state.max_iters(max_iters))
        .run()
        .map_err(|e| OdeFitError::Optimization(format!("{:#}", e)))?;

    let z = res
        .state
        .best_param
        .ok_or_else(|| OdeFitError::Optimization("no best point".to_string()))?;
    let cost = res.state.best_cost;
    if cost >= PENALTY {
        return Err(OdeFitError::Optimization(
            "no point with a finite log density was found".to_string(),
        ));
    }
    Ok(MapEstimate {
        x: density.to_constrained(&z),
        z,
        log_density: -cost,
        iterations: res.state.iter,
    })
}

/// A simplex around `start`, stepping each coordinate by 10% or at least 0.25
fn create_initial_simplex(start: &[f64]) -> Vec<Vec<f64>> {
    let mut vertices = Vec::with_capacity(start.len() + 1);
    vertices.push(start.to_vec());
    for i in 0..start.len() {
        let mut vertex = start.to_vec();
        vertex[i] += (0.1 * start[i].abs()).max(0.25);
        vertices.push(vertex);
    }
    vertices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use approx::assert_relative_eq;

    struct Shifted;

    impl LogDensity for Shifted {
        fn dim(&self) -> usize {
            2
        }

        fn logp_and_grad(&self, z: &[f64], grad: &mut [f64]) -> Result<f64, OdeFitError> {
            grad[0] = -(z[0] - 1.5);
            grad[1] = -4.0 * (z[1] + 0.5);
            Ok(-0.5 * (z[0] - 1.5).powi(2) - 2.0 * (z[1] + 0.5).powi(2))
        }

        fn to_constrained(&self, z: &[f64]) -> Vec<f64> {
            z.iter().map(|z| z.exp()).collect()
        }
    }

    #[test]
    fn finds_the_mode() {
        let map = find_map(&Shifted, &[0.0, 0.0], 1_000).unwrap();
        assert_relative_eq!(map.z[0], 1.5, epsilon = 1e-3);
        assert_relative_eq!(map.z[1], -0.5, epsilon = 1e-3);
        assert_relative_eq!(map.x[0], 1.5f64.exp(), epsilon = 1e-2);
        assert_relative_eq!(map.log_density, 0.0, epsilon = 1e-6);
    }

    struct Broken;

    impl LogDensity for Broken {
        fn dim(&self) -> usize {
            1
        }

        fn logp_and_grad(&self, _z: &[f64], _grad: &mut [f64]) -> Result<f64, OdeFitError> {
            Err(ConfigError::invalid("model", "broken").into())
        }
    }

    #[test]
    fn fatal_errors_become_optimization_errors() {
        let err = find_map(&Broken, &[0.0], 10).unwrap_err();
        assert!(matches!(err, OdeFitError::Optimization(_)));
    }
}
