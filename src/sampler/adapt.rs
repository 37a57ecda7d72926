//! Warmup adaptation: dual-averaging step size and a diagonal mass matrix
//! estimated in doubling slow windows.

use crate::error::OdeFitError;
use crate::sampler::hmc::{Leapfrog, Metric};
use crate::sampler::LogDensity;

/// Nesterov dual averaging of `log(step_size)` toward a target acceptance rate
#[derive(Debug, Clone)]
pub(crate) struct DualAveraging {
    target_accept: f64,
    log_eps: f64,
    log_eps_bar: f64,
    h_bar: f64,
    mu: f64,
    gamma: f64,
    t0: f64,
    kappa: f64,
    step: usize,
}

impl DualAveraging {
    pub(crate) fn new(target_accept: f64, init_eps: f64) -> Self {
        let log_eps = init_eps.ln();
        DualAveraging {
            target_accept,
            log_eps,
            log_eps_bar: log_eps,
            h_bar: 0.0,
            mu: (10.0 * init_eps).ln(),
            gamma: 0.05,
            t0: 10.0,
            kappa: 0.75,
            step: 0,
        }
    }

    pub(crate) fn update(&mut self, accept_prob: f64) {
        self.step += 1;
        let m = self.step as f64;
        let w = 1.0 / (m + self.t0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target_accept - accept_prob);
        self.log_eps = self.mu - m.sqrt() / self.gamma * self.h_bar;
        let eta = m.powf(-self.kappa);
        self.log_eps_bar = eta * self.log_eps + (1.0 - eta) * self.log_eps_bar;
    }

    pub(crate) fn step_size(&self) -> f64 {
        self.log_eps.exp()
    }

    /// The averaged iterate, used once warmup is over
    pub(crate) fn adapted_step_size(&self) -> f64 {
        self.log_eps_bar.exp()
    }

    pub(crate) fn restart(&mut self, init_eps: f64) {
        *self = DualAveraging::new(self.target_accept, init_eps);
    }
}

/// Online per-coordinate variance
#[derive(Debug, Clone)]
pub(crate) struct WelfordVariance {
    mean: Vec<f64>,
    m2: Vec<f64>,
    count: usize,
}

impl WelfordVariance {
    pub(crate) fn new(dim: usize) -> Self {
        WelfordVariance {
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
            count: 0,
        }
    }

    pub(crate) fn update(&mut self, x: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for ((mean, m2), &x) in self.mean.iter_mut().zip(self.m2.iter_mut()).zip(x) {
            let delta = x - *mean;
            *mean += delta / n;
            *m2 += delta * (x - *mean);
        }
    }

    /// Sample variance shrunk toward `1e-3`, as Stan regularizes it
    pub(crate) fn regularized_variance(&self) -> Vec<f64> {
        if self.count < 2 {
            return vec![1.0; self.mean.len()];
        }
        let n = self.count as f64;
        self.m2
            .iter()
            .map(|m2| {
                let var = m2 / (n - 1.0);
                (n / (n + 5.0)) * var + 1e-3 * (5.0 / (n + 5.0))
            })
            .collect()
    }

    pub(crate) fn reset(&mut self) {
        self.mean.fill(0.0);
        self.m2.fill(0.0);
        self.count = 0;
    }
}

const INIT_BUFFER: usize = 75;
const TERM_BUFFER: usize = 50;
const BASE_WINDOW: usize = 25;

/// Warmup windows as `(start, end)` iteration ranges.
///
/// The first and last windows adapt the step size only; the ones in between
/// also collect draws for the metric. Runs shorter than 50 iterations adapt
/// the step size only.
pub(crate) fn compute_windows(n_warmup: usize) -> Vec<(usize, usize)> {
    if n_warmup < 50 {
        return vec![(0, n_warmup)];
    }

    let (init, term, base) = if INIT_BUFFER + TERM_BUFFER + BASE_WINDOW > n_warmup {
        // 15% / 10% / 75% split
        let init = n_warmup * 15 / 100;
        let term = n_warmup / 10;
        (init, term, n_warmup - init - term)
    } else {
        (INIT_BUFFER, TERM_BUFFER, BASE_WINDOW)
    };

    let slow_end = n_warmup - term;
    let mut windows = vec![(0, init)];
    let mut start = init;
    let mut size = base;
    while start < slow_end {
        let mut end = start + size;
        // a window whose successor would not fit absorbs the remainder
        if end + 2 * size > slow_end {
            end = slow_end;
        }
        windows.push((start, end));
        start = end;
        size *= 2;
    }
    windows.push((slow_end, n_warmup));
    windows
}

/// The full warmup schedule
#[derive(Debug, Clone)]
pub(crate) struct WindowedAdaptation {
    dual: DualAveraging,
    welford: WelfordVariance,
    windows: Vec<(usize, usize)>,
    current: usize,
    metric: Metric,
}

impl WindowedAdaptation {
    pub(crate) fn new(dim: usize, n_warmup: usize, target_accept: f64, init_eps: f64) -> Self {
        WindowedAdaptation {
            dual: DualAveraging::new(target_accept, init_eps),
            welford: WelfordVariance::new(dim),
            windows: compute_windows(n_warmup),
            current: 0,
            metric: Metric::identity(dim),
        }
    }

    fn is_slow(&self, window: usize) -> bool {
        self.windows.len() > 2 && window > 0 && window + 1 < self.windows.len()
    }

    /// Record warmup iteration `iter`. Returns `true` when the metric changed,
    /// after which the caller should restart the step size with [Self::restart].
    pub(crate) fn update(&mut self, iter: usize, q: &[f64], accept_prob: f64) -> bool {
        self.dual.update(accept_prob);
        let Some(&(_, end)) = self.windows.get(self.current) else {
            return false;
        };
        let slow = self.is_slow(self.current);
        if slow {
            self.welford.update(q);
        }
        if iter + 1 < end {
            return false;
        }
        self.current += 1;
        if slow {
            self.metric = Metric::from_variance(self.welford.regularized_variance());
            self.welford.reset();
            return true;
        }
        false
    }

    pub(crate) fn restart(&mut self, init_eps: f64) {
        self.dual.restart(init_eps);
    }

    pub(crate) fn step_size(&self) -> f64 {
        self.dual.step_size()
    }

    pub(crate) fn adapted_step_size(&self) -> f64 {
        self.dual.adapted_step_size()
    }

    pub(crate) fn metric(&self) -> &Metric {
        &self.metric
    }
}

/// Double or halve the step size until the one-step acceptance probability
/// of a unit-momentum leapfrog step crosses 0.8
pub(crate) fn find_reasonable_step_size<D: LogDensity + ?Sized>(
    density: &D,
    q: &[f64],
    metric: &Metric,
    init_eps: f64,
) -> Result<f64, OdeFitError> {
    let leapfrog = Leapfrog::new(density, 1.0, metric.clone());
    let mut start = leapfrog.init_state(q.to_vec())?;
    start.p = metric.inv_mass().iter().map(|m| 1.0 / m.sqrt()).collect();
    let h0 = start.hamiltonian(metric);

    let log_accept = |eps: f64| -> Result<f64, OdeFitError> {
        let leapfrog = Leapfrog::new(density, eps, metric.clone());
        let mut state = start.clone();
        leapfrog.step(&mut state, 1.0)?;
        let delta = h0 - state.hamiltonian(metric);
        Ok(if delta.is_nan() { f64::NEG_INFINITY } else { delta })
    };

    let threshold = 0.8f64.ln();
    let mut eps = init_eps;
    let direction = if log_accept(eps)? > threshold { 1 } else { -1 };
    for _ in 0..100 {
        let next = if direction > 0 { eps * 2.0 } else { eps * 0.5 };
        if !(1e-10..=1e3).contains(&next) {
            break;
        }
        let crossed = match direction {
            1 => log_accept(next)? < threshold,
            _ => log_accept(next)? > threshold,
        };
        eps = next;
        if crossed {
            break;
        }
    }
    Ok(eps)
}
