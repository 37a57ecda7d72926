//! Convergence diagnostics: rank-normalized split R-hat, bulk and tail ESS,
//! E-BFMI, and per-quantity posterior summaries.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::sampler::chain::Chain;

/// Divergence rate above which a warning is emitted
pub const DIVERGENCE_WARN_RATE: f64 = 0.01;
pub const R_HAT_WARN: f64 = 1.05;
pub const EBFMI_WARN: f64 = 0.3;

/// Aggregate sampler diagnostics over all chains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub n_chains: usize,
    /// Post-warmup draws over all chains
    pub n_draws: usize,
    /// Mean acceptance statistic of the post-warmup transitions
    pub acceptance_rate: f64,
    pub n_divergent: usize,
    pub divergence_rate: f64,
    /// Log-density evaluations that failed and were treated as rejections,
    /// warmup included
    pub n_rejected: usize,
    pub max_treedepth_rate: f64,
    /// Per parameter, in parameter order
    pub r_hat: Vec<f64>,
    pub ess_bulk: Vec<f64>,
    pub ess_tail: Vec<f64>,
    /// Per chain
    pub ebfmi: Vec<f64>,
    pub step_sizes: Vec<f64>,
}

/// Marginal posterior summary of one parameter or derived quantity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub q05: f64,
    pub median: f64,
    pub q95: f64,
    pub r_hat: f64,
    pub ess_bulk: f64,
    pub ess_tail: f64,
}

impl ParameterSummary {
    pub fn new(name: impl Into<String>, chains: &[Vec<f64>]) -> Self {
        let mut all: Vec<f64> = chains.iter().flatten().copied().collect();
        let n = all.len() as f64;
        let mean = all.iter().sum::<f64>() / n;
        let sd = (all.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0).max(1.0)).sqrt();
        all.sort_by(f64::total_cmp);
        ParameterSummary {
            name: name.into(),
            mean,
            sd,
            q05: quantile_sorted(&all, 0.05),
            median: quantile_sorted(&all, 0.5),
            q95: quantile_sorted(&all, 0.95),
            r_hat: r_hat(chains),
            ess_bulk: ess_bulk(chains),
            ess_tail: ess_tail(chains),
        }
    }
}

impl Diagnostics {
    /// Diagnostics for the named parameters, the leading columns of every chain
    pub(crate) fn compute(chains: &[Chain], names: &[String]) -> Self {
        let stats = || chains.iter().flat_map(|c| c.stats.iter());
        let n_draws = stats().count();
        let rate = |count: usize| {
            if n_draws > 0 {
                count as f64 / n_draws as f64
            } else {
                0.0
            }
        };
        let n_divergent = stats().filter(|s| s.divergent).count();
        let at_max_depth = chains
            .iter()
            .map(|c| {
                c.stats
                    .iter()
                    .filter(|s| s.tree_depth >= c.max_treedepth)
                    .count()
            })
            .sum();
        let acceptance_rate = if n_draws > 0 {
            stats().map(|s| s.accept_prob).sum::<f64>() / n_draws as f64
        } else {
            f64::NAN
        };

        let columns: Vec<Vec<Vec<f64>>> = (0..names.len())
            .map(|k| chains.iter().map(|c| c.column(k)).collect())
            .collect();

        let diagnostics = Diagnostics {
            n_chains: chains.len(),
            n_draws,
            acceptance_rate,
            n_divergent,
            divergence_rate: rate(n_divergent),
            n_rejected: chains.iter().map(|c| c.n_rejected).sum(),
            max_treedepth_rate: rate(at_max_depth),
            r_hat: columns.iter().map(|c| r_hat(c)).collect(),
            ess_bulk: columns.iter().map(|c| ess_bulk(c)).collect(),
            ess_tail: columns.iter().map(|c| ess_tail(c)).collect(),
            ebfmi: chains.iter().map(|c| ebfmi(&c.energies())).collect(),
            step_sizes: chains.iter().map(|c| c.step_size).collect(),
        };
        diagnostics.warn(names);
        diagnostics
    }

    fn warn(&self, names: &[String]) {
        if self.divergence_rate > DIVERGENCE_WARN_RATE {
            tracing::warn!(
                divergent = self.n_divergent,
                draws = self.n_draws,
                "{:.1}% of transitions diverged; consider a higher target acceptance rate",
                100.0 * self.divergence_rate
            );
        }
        for (name, r_hat) in names.iter().zip(&self.r_hat) {
            if *r_hat > R_HAT_WARN {
                tracing::warn!(parameter = %name, r_hat, "chains have not mixed");
            }
        }
        for (chain, e) in self.ebfmi.iter().enumerate() {
            if *e < EBFMI_WARN {
                tracing::warn!(chain, ebfmi = e, "low E-BFMI");
            }
        }
    }

    pub fn max_r_hat(&self) -> f64 {
        self.r_hat
            .iter()
            .copied()
            .filter(|r| r.is_finite())
            .fold(f64::NAN, f64::max)
    }

    pub fn min_ess_bulk(&self) -> f64 {
        self.ess_bulk.iter().copied().fold(f64::NAN, f64::min)
    }
}

fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let f = pos - lo as f64;
    sorted[lo] * (1.0 - f) + sorted[hi] * f
}

/// Halve every chain and truncate the halves to a common length
fn split_halves(chains: &[Vec<f64>]) -> Option<Vec<&[f64]>> {
    if chains.is_empty() || chains.iter().any(|c| c.len() < 4) {
        return None;
    }
    let halves: Vec<&[f64]> = chains
        .iter()
        .flat_map(|c| {
            let (a, b) = c.split_at(c.len() / 2);
            [a, b]
        })
        .collect();
    let n = halves.iter().map(|h| h.len()).min()?;
    Some(halves.into_iter().map(|h| &h[..n]).collect())
}

fn mean_and_variance(x: &[f64]) -> (f64, f64) {
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var)
}

/// Between- and within-chain variance of split chains: `(var_plus, W)`
fn pooled_variance(halves: &[&[f64]]) -> (f64, f64) {
    let m = halves.len() as f64;
    let n = halves[0].len() as f64;
    let (means, vars): (Vec<f64>, Vec<f64>) = halves.iter().map(|h| mean_and_variance(h)).unzip();
    let grand = means.iter().sum::<f64>() / m;
    let b = n / (m - 1.0) * means.iter().map(|mu| (mu - grand).powi(2)).sum::<f64>();
    let w = vars.iter().sum::<f64>() / m;
    ((n - 1.0) / n * w + b / n, w)
}

/// Classic split R-hat
pub fn split_r_hat(chains: &[Vec<f64>]) -> f64 {
    let Some(halves) = split_halves(chains) else {
        return f64::NAN;
    };
    let (var_plus, w) = pooled_variance(&halves);
    if w < 1e-300 {
        return f64::NAN;
    }
    (var_plus / w).sqrt()
}

/// Replace draws by normal scores of their pooled ranks, ties averaged
fn rank_normalize(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut flat: Vec<(f64, usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(c, chain)| chain.iter().enumerate().map(move |(i, &x)| (x, c, i)))
        .collect();
    flat.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut out: Vec<Vec<f64>> = chains.iter().map(|c| vec![0.0; c.len()]).collect();
    let Ok(normal) = Normal::new(0.0, 1.0) else {
        return out;
    };
    let n = flat.len() as f64;
    let mut i = 0;
    while i < flat.len() {
        let mut j = i + 1;
        while j < flat.len() && flat[j].0 == flat[i].0 {
            j += 1;
        }
        // average 1-based rank of the tie group, offset by 3/8 (Blom)
        let rank = 0.5 * ((i + 1) as f64 + j as f64);
        let z = normal.inverse_cdf((rank - 0.375) / (n + 0.25));
        for &(_, c, t) in &flat[i..j] {
            out[c][t] = z;
        }
        i = j;
    }
    out
}

/// Rank-normalized split R-hat, the larger of the bulk and folded versions
pub fn r_hat(chains: &[Vec<f64>]) -> f64 {
    if split_halves(chains).is_none() {
        return f64::NAN;
    }
    let bulk = split_r_hat(&rank_normalize(chains));

    let mut all: Vec<f64> = chains.iter().flatten().copied().collect();
    all.sort_by(f64::total_cmp);
    let median = quantile_sorted(&all, 0.5);
    let folded: Vec<Vec<f64>> = chains
        .iter()
        .map(|c| c.iter().map(|x| (x - median).abs()).collect())
        .collect();
    let tail = split_r_hat(&rank_normalize(&folded));
    match (bulk.is_nan(), tail.is_nan()) {
        (true, _) => tail,
        (_, true) => bulk,
        _ => bulk.max(tail),
    }
}

/// Effective sample size of split chains, Geyer's initial monotone sequence
/// over variogram autocorrelations
pub fn ess(chains: &[Vec<f64>]) -> f64 {
    let Some(halves) = split_halves(chains) else {
        return f64::NAN;
    };
    let m = halves.len();
    let n = halves[0].len();
    let total = (m * n) as f64;
    let (var_plus, _) = pooled_variance(&halves);
    if !var_plus.is_finite() || var_plus < 1e-300 {
        return total;
    }

    let rho = |lag: usize| -> f64 {
        let v = halves
            .iter()
            .map(|h| (0..n - lag).map(|i| (h[i] - h[i + lag]).powi(2)).sum::<f64>())
            .sum::<f64>()
            / (m * (n - lag)) as f64;
        1.0 - v / (2.0 * var_plus)
    };

    let mut tau = -1.0;
    let mut previous = f64::INFINITY;
    let mut lag = 0;
    while lag + 1 < n {
        let pair = rho(lag) + rho(lag + 1);
        if pair < 0.0 {
            break;
        }
        let pair = pair.min(previous);
        tau += 2.0 * pair;
        previous = pair;
        lag += 2;
    }
    if tau <= 0.0 {
        return total;
    }
    (total / tau).clamp(1.0, total * total.log10().max(1.0))
}

pub fn ess_bulk(chains: &[Vec<f64>]) -> f64 {
    ess(&rank_normalize(chains))
}

/// The smaller ESS of the 5% and 95% quantile indicator chains
pub fn ess_tail(chains: &[Vec<f64>]) -> f64 {
    let mut all: Vec<f64> = chains.iter().flatten().copied().collect();
    all.sort_by(f64::total_cmp);
    let q05 = quantile_sorted(&all, 0.05);
    let q95 = quantile_sorted(&all, 0.95);
    let indicator = |f: &dyn Fn(f64) -> bool| -> Vec<Vec<f64>> {
        chains
            .iter()
            .map(|c| c.iter().map(|&x| if f(x) { 1.0 } else { 0.0 }).collect())
            .collect()
    };
    let lower = ess(&indicator(&|x: f64| x <= q05));
    let upper = ess(&indicator(&|x: f64| x <= q95));
    lower.min(upper)
}

/// Energy Bayesian fraction of missing information for one chain
pub fn ebfmi(energies: &[f64]) -> f64 {
    if energies.len() < 4 {
        return f64::NAN;
    }
    let n = energies.len() as f64;
    let mean = energies.iter().sum::<f64>() / n;
    let var = energies.iter().map(|e| (e - mean).powi(2)).sum::<f64>();
    if var < 1e-300 {
        return f64::NAN;
    }
    let msd = energies.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum::<f64>();
    msd / var
}
