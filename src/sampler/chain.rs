//! Per-chain state machine and the merged multi-chain result.

use indicatif::ProgressBar;
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, OdeFitError};
use crate::sampler::adapt::{find_reasonable_step_size, WindowedAdaptation};
use crate::sampler::diagnostics::{Diagnostics, ParameterSummary};
use crate::sampler::hmc::{Leapfrog, Metric};
use crate::sampler::nuts::{transition, Transition};
use crate::sampler::{CancellationToken, LogDensity, SamplerConfig};

/// Attempts at finding an initial point with a finite log density
pub const MAX_INIT_ATTEMPTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Warmup,
    Sampling,
    Done,
}

/// Sampler statistics of one post-warmup transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawStats {
    pub log_density: f64,
    pub accept_prob: f64,
    pub step_size: f64,
    pub tree_depth: usize,
    pub n_leapfrog: usize,
    pub divergent: bool,
    pub energy: f64,
}

/// Post-warmup draws of one chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub chain_id: usize,
    pub seed: u64,
    /// Constrained draws, one row per draw
    pub draws: Vec<Vec<f64>>,
    pub unconstrained: Vec<Vec<f64>>,
    /// Deterministic quantities, one row per draw
    pub derived: Vec<Vec<f64>>,
    pub stats: Vec<DrawStats>,
    pub step_size: f64,
    /// Diagonal of the adapted inverse mass matrix
    pub inv_mass: Vec<f64>,
    pub n_rejected: usize,
    pub warmup_completed: usize,
    pub max_treedepth: usize,
    /// The phase the chain stopped in; anything but `Done` means it was
    /// cancelled
    pub phase: Phase,
}

impl Chain {
    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    pub fn was_cancelled(&self) -> bool {
        self.phase != Phase::Done
    }

    /// Column `k` of the parameters followed by the derived quantities
    pub fn column(&self, k: usize) -> Vec<f64> {
        let dim = self.draws.first().map_or(0, |d| d.len());
        if k < dim {
            self.draws.iter().map(|d| d[k]).collect()
        } else {
            self.derived.iter().map(|d| d[k - dim]).collect()
        }
    }

    pub fn energies(&self) -> Vec<f64> {
        self.stats.iter().map(|s| s.energy).collect()
    }

    /// Constrained draws as a `(draw, parameter)` array
    pub fn draws_array(&self) -> Array2<f64> {
        let cols = self.draws.first().map_or(0, |d| d.len());
        Array2::from_shape_fn((self.draws.len(), cols), |(i, j)| self.draws[i][j])
    }
}

/// Drives one chain through `Warmup -> Sampling -> Done`
pub(crate) struct ChainRunner<'a, D: LogDensity + ?Sized> {
    density: &'a D,
    config: &'a SamplerConfig,
    chain_id: usize,
    seed: u64,
    rng: StdRng,
    phase: Phase,
    cancel: CancellationToken,
    bar: ProgressBar,
}

impl<'a, D: LogDensity + ?Sized> ChainRunner<'a, D> {
    pub(crate) fn new(
        density: &'a D,
        config: &'a SamplerConfig,
        chain_id: usize,
        cancel: CancellationToken,
        bar: ProgressBar,
    ) -> Self {
        let seed = config.seed.wrapping_add(chain_id as u64);
        ChainRunner {
            density,
            config,
            chain_id,
            seed,
            rng: StdRng::seed_from_u64(seed),
            phase: Phase::Warmup,
            cancel,
            bar,
        }
    }

    fn finite_at(&self, z: &[f64]) -> Result<bool, OdeFitError> {
        match self.density.logp(z) {
            Ok(lp) => Ok(lp.is_finite()),
            Err(e) if e.is_recoverable() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Draw from the priors, or jitter `base`, until the log density is finite
    fn initial_point(&mut self, base: Option<&[f64]>) -> Result<Vec<f64>, OdeFitError> {
        let jitter = self.config.init_jitter;
        for attempt in 0..MAX_INIT_ATTEMPTS {
            let z = match base {
                None => self.density.initial_point(&mut self.rng),
                Some(base) if jitter > 0.0 => base
                    .iter()
                    .map(|z| {
                        let e: f64 = self.rng.sample(StandardNormal);
                        z + jitter * e
                    })
                    .collect(),
                Some(base) => {
                    if self.finite_at(base)? {
                        return Ok(base.to_vec());
                    }
                    break;
                }
            };
            if self.finite_at(&z)? {
                return Ok(z);
            }
            tracing::debug!(chain = self.chain_id, attempt, "initial point rejected");
        }
        Err(ConfigError::invalid(
            "init",
            format!("no initial point with a finite log density for chain {}", self.chain_id),
        )
        .into())
    }

    fn cancelled(&self) -> bool {
        if self.cancel.is_cancelled() {
            tracing::info!(chain = self.chain_id, phase = ?self.phase, "chain cancelled");
            return true;
        }
        false
    }

    pub(crate) fn run(mut self, base: Option<&[f64]>) -> Result<Chain, OdeFitError> {
        let dim = self.density.dim();
        let n_warmup = self.config.n_warmup;
        let z0 = self.initial_point(base)?;
        let eps0 = find_reasonable_step_size(self.density, &z0, &Metric::identity(dim), 1.0)?;
        let mut adaptation =
            WindowedAdaptation::new(dim, n_warmup, self.config.target_accept, eps0);
        let mut state = Leapfrog::new(self.density, eps0, Metric::identity(dim)).init_state(z0)?;
        let mut n_rejected = 0;

        let mut chain = Chain {
            chain_id: self.chain_id,
            seed: self.seed,
            draws: Vec::with_capacity(self.config.n_draws),
            unconstrained: Vec::with_capacity(self.config.n_draws),
            derived: Vec::with_capacity(self.config.n_draws),
            stats: Vec::with_capacity(self.config.n_draws),
            step_size: eps0,
            inv_mass: vec![1.0; dim],
            n_rejected: 0,
            warmup_completed: 0,
            max_treedepth: self.config.max_treedepth,
            phase: Phase::Warmup,
        };

        self.bar.set_message("warmup");
        for iter in 0..n_warmup {
            if self.cancelled() {
                chain.n_rejected = n_rejected;
                return Ok(chain);
            }
            let leapfrog = Leapfrog::new(
                self.density,
                adaptation.step_size(),
                adaptation.metric().clone(),
            );
            let t = transition(&leapfrog, &state, self.config.max_treedepth, &mut self.rng)?;
            n_rejected += leapfrog.rejected();
            state = t.state;
            if adaptation.update(iter, &state.q, t.accept_prob) {
                let eps = find_reasonable_step_size(
                    self.density,
                    &state.q,
                    adaptation.metric(),
                    adaptation.step_size(),
                )?;
                adaptation.restart(eps);
            }
            chain.warmup_completed += 1;
            self.bar.inc(1);
        }

        let step_size = if n_warmup > 0 {
            adaptation.adapted_step_size()
        } else {
            eps0
        };
        let metric = adaptation.metric().clone();
        chain.step_size = step_size;
        chain.inv_mass = metric.inv_mass().to_vec();
        self.phase = Phase::Sampling;
        chain.phase = Phase::Sampling;
        tracing::info!(
            chain = self.chain_id,
            step_size,
            rejected = n_rejected,
            "warmup finished"
        );

        self.bar.set_message("sampling");
        let leapfrog = Leapfrog::new(self.density, step_size, metric);
        for _ in 0..self.config.n_draws {
            if self.cancelled() {
                chain.n_rejected = n_rejected + leapfrog.rejected();
                return Ok(chain);
            }
            let t = transition(&leapfrog, &state, self.config.max_treedepth, &mut self.rng)?;
            self.record(&mut chain, &t, step_size);
            state = t.state;
            self.bar.inc(1);
        }

        chain.n_rejected = n_rejected + leapfrog.rejected();
        self.phase = Phase::Done;
        chain.phase = Phase::Done;
        self.bar.finish_with_message("done");
        tracing::info!(
            chain = self.chain_id,
            draws = chain.len(),
            divergent = chain.stats.iter().filter(|s| s.divergent).count(),
            "chain finished"
        );
        Ok(chain)
    }

    fn record(&self, chain: &mut Chain, t: &Transition, step_size: f64) {
        let x = self.density.to_constrained(&t.state.q);
        chain.derived.push(self.density.derived(&x));
        chain.draws.push(x);
        chain.unconstrained.push(t.state.q.clone());
        chain.stats.push(DrawStats {
            log_density: t.state.log_density(),
            accept_prob: t.accept_prob,
            step_size,
            tree_depth: t.depth,
            n_leapfrog: t.n_leapfrog,
            divergent: t.divergent,
            energy: t.energy,
        });
    }
}

/// Merged output of all chains
#[derive(Debug, Clone, Serialize)]
pub struct SamplerResult {
    pub parameter_names: Vec<String>,
    pub derived_names: Vec<String>,
    pub chains: Vec<Chain>,
    pub diagnostics: Diagnostics,
    /// Parameters followed by derived quantities
    pub summary: Vec<ParameterSummary>,
    pub config: SamplerConfig,
}

impl SamplerResult {
    pub(crate) fn new(
        parameter_names: Vec<String>,
        derived_names: Vec<String>,
        chains: Vec<Chain>,
        config: SamplerConfig,
    ) -> Self {
        let diagnostics = Diagnostics::compute(&chains, &parameter_names);
        let mut result = SamplerResult {
            parameter_names,
            derived_names,
            chains,
            diagnostics,
            summary: Vec::new(),
            config,
        };
        if result.total_draws() > 0 {
            result.summary = result
                .names()
                .enumerate()
                .map(|(k, name)| ParameterSummary::new(name.as_str(), &result.per_chain(k)))
                .collect();
        }
        tracing::info!(
            chains = result.chains.len(),
            draws = result.total_draws(),
            divergent = result.diagnostics.n_divergent,
            rejected = result.diagnostics.n_rejected,
            "sampling finished"
        );
        result
    }

    fn names(&self) -> impl Iterator<Item = &String> {
        self.parameter_names.iter().chain(&self.derived_names)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.names().position(|n| n == name)
    }

    fn per_chain(&self, k: usize) -> Vec<Vec<f64>> {
        self.chains.iter().map(|c| c.column(k)).collect()
    }

    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn total_draws(&self) -> usize {
        self.chains.iter().map(Chain::len).sum()
    }

    /// Draws of a parameter or derived quantity, per chain
    pub fn chain_draws(&self, name: &str) -> Option<Vec<Vec<f64>>> {
        self.index_of(name).map(|k| self.per_chain(k))
    }

    /// Draws of a parameter or derived quantity, all chains pooled
    pub fn draws_of(&self, name: &str) -> Option<Vec<f64>> {
        self.chain_draws(name)
            .map(|chains| chains.into_iter().flatten().collect())
    }

    pub fn mean(&self, name: &str) -> Option<f64> {
        let draws = self.draws_of(name)?;
        if draws.is_empty() {
            return None;
        }
        Some(draws.iter().sum::<f64>() / draws.len() as f64)
    }

    pub fn summary_of(&self, name: &str) -> Option<&ParameterSummary> {
        self.summary.iter().find(|s| s.name == name)
    }

    /// `(chain, draw, quantity)` array over parameters then derived
    /// quantities, truncated to the shortest chain
    pub fn trace(&self) -> Array3<f64> {
        let n_draws = self.chains.iter().map(Chain::len).min().unwrap_or(0);
        let n_quantities = self.parameter_names.len() + self.derived_names.len();
        let dim = self.parameter_names.len();
        Array3::from_shape_fn((self.chains.len(), n_draws, n_quantities), |(c, i, k)| {
            let chain = &self.chains[c];
            if k < dim {
                chain.draws[i][k]
            } else {
                chain.derived[i][k - dim]
            }
        })
    }

    pub fn to_json(&self) -> Result<String, OdeFitError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
