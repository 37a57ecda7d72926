//! NUTS posterior sampling with a windowed warmup, run as independent
//! parallel chains.
pub mod adapt;
pub mod chain;
pub mod diagnostics;
pub mod hmc;
pub mod nuts;
mod progress;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, OdeFitError};
use crate::optimize::map::{find_map, MAX_MAP_ITERS};

pub use chain::{Chain, DrawStats, Phase, SamplerResult};
pub use diagnostics::{Diagnostics, ParameterSummary};

use chain::ChainRunner;
use progress::Progress;

/// A differentiable log density over an unconstrained space
///
/// `logp_and_grad` may fail; recoverable failures
/// ([OdeFitError::is_recoverable]) reject the proposal, anything else aborts
/// the run.
pub trait LogDensity: Sync {
    fn dim(&self) -> usize;

    fn parameter_names(&self) -> Vec<String> {
        (0..self.dim()).map(|i| format!("x[{}]", i)).collect()
    }

    /// Log density at `z`, writing its gradient into `grad`
    fn logp_and_grad(&self, z: &[f64], grad: &mut [f64]) -> Result<f64, OdeFitError>;

    fn logp(&self, z: &[f64]) -> Result<f64, OdeFitError> {
        let mut grad = vec![0.0; z.len()];
        self.logp_and_grad(z, &mut grad)
    }

    fn to_constrained(&self, z: &[f64]) -> Vec<f64> {
        z.to_vec()
    }

    fn to_unconstrained(&self, x: &[f64]) -> Vec<f64> {
        x.to_vec()
    }

    /// A central point, used as the start of the MAP search
    fn default_point(&self) -> Vec<f64> {
        vec![0.0; self.dim()]
    }

    /// A random unconstrained starting point
    fn initial_point(&self, rng: &mut StdRng) -> Vec<f64> {
        (0..self.dim()).map(|_| rng.random_range(-2.0..2.0)).collect()
    }

    fn derived_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Deterministic quantities at the constrained point `x`
    fn derived(&self, _x: &[f64]) -> Vec<f64> {
        Vec::new()
    }
}

/// Where chains start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStrategy {
    /// Independent draws from the priors
    Prior,
    /// A constrained point shared by all chains
    Point(Vec<f64>),
    /// The posterior mode, found by Nelder-Mead
    Map,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub n_warmup: usize,
    pub n_draws: usize,
    pub n_chains: usize,
    pub target_accept: f64,
    pub max_treedepth: usize,
    /// Chain `i` is seeded with `seed + i`
    pub seed: u64,
    pub init: InitStrategy,
    /// Standard deviation of normal noise added to a `Point` or `Map`
    /// start in unconstrained space, per chain
    pub init_jitter: f64,
    pub progress: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            n_warmup: 1000,
            n_draws: 1000,
            n_chains: 4,
            target_accept: 0.8,
            max_treedepth: 10,
            seed: 42,
            init: InitStrategy::Prior,
            init_jitter: 0.0,
            progress: false,
        }
    }
}

impl SamplerConfig {
    pub fn with_iterations(mut self, n_warmup: usize, n_draws: usize) -> Self {
        self.n_warmup = n_warmup;
        self.n_draws = n_draws;
        self
    }

    pub fn with_chains(mut self, n_chains: usize) -> Self {
        self.n_chains = n_chains;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_init(mut self, init: InitStrategy) -> Self {
        self.init = init;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_draws == 0 {
            return Err(ConfigError::invalid("n_draws", "must be > 0"));
        }
        if self.n_chains == 0 {
            return Err(ConfigError::invalid("n_chains", "must be > 0"));
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(ConfigError::invalid("target_accept", "must be in (0, 1)"));
        }
        if self.max_treedepth == 0 {
            return Err(ConfigError::invalid("max_treedepth", "must be > 0"));
        }
        if !self.init_jitter.is_finite() || self.init_jitter < 0.0 {
            return Err(ConfigError::invalid("init_jitter", "must be finite and >= 0"));
        }
        if let InitStrategy::Point(x) = &self.init {
            if x.iter().any(|v| !v.is_finite()) {
                return Err(ConfigError::invalid("init", "point must be finite"));
            }
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, OdeFitError> {
        let config: SamplerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Stops every chain of a run at its next transition
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run `config.n_chains` NUTS chains in parallel
pub fn sample<D: LogDensity>(
    density: &D,
    config: &SamplerConfig,
) -> Result<SamplerResult, OdeFitError> {
    sample_with_cancellation(density, config, &CancellationToken::new())
}

/// As [sample]; cancelled chains return the draws they have so far
pub fn sample_with_cancellation<D: LogDensity>(
    density: &D,
    config: &SamplerConfig,
    cancel: &CancellationToken,
) -> Result<SamplerResult, OdeFitError> {
    config.validate()?;
    let dim = density.dim();
    if dim == 0 {
        return Err(ConfigError::invalid("dim", "nothing to sample").into());
    }

    let base = match &config.init {
        InitStrategy::Prior => None,
        InitStrategy::Point(x) => {
            if x.len() != dim {
                return Err(ConfigError::mismatch("initial point", dim, x.len()).into());
            }
            Some(density.to_unconstrained(x))
        }
        InitStrategy::Map => {
            let map = find_map(density, &density.default_point(), MAX_MAP_ITERS)?;
            tracing::info!(point = ?map.x, log_density = map.log_density, "MAP initialization");
            Some(map.z)
        }
    };

    tracing::info!(
        chains = config.n_chains,
        warmup = config.n_warmup,
        draws = config.n_draws,
        "starting NUTS"
    );
    let progress = Progress::new(config.progress);
    let total = (config.n_warmup + config.n_draws) as u64;
    let chains: Vec<Result<Chain, OdeFitError>> = (0..config.n_chains)
        .into_par_iter()
        .map(|chain_id| {
            let bar = progress.chain_bar(chain_id, total);
            ChainRunner::new(density, config, chain_id, cancel.clone(), bar).run(base.as_deref())
        })
        .collect();
    let chains = chains.into_iter().collect::<Result<Vec<_>, _>>()?;

    Ok(SamplerResult::new(
        density.parameter_names(),
        density.derived_names(),
        chains,
        config.clone(),
    ))
}
