use crate::simulator::{M, V};

/// States, and optionally sensitivities, at the requested output times
///
/// `states` has one row per time. When present, `sensitivities[i]` is the
/// `nstates x (ntheta + nstates)` matrix `[dy/dtheta | dy/dy0]` at `times[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    times: Vec<f64>,
    states: M,
    sensitivities: Option<Vec<M>>,
    n_theta: usize,
}

impl Trajectory {
    pub(crate) fn new(
        times: Vec<f64>,
        states: M,
        sensitivities: Option<Vec<M>>,
        n_theta: usize,
    ) -> Self {
        Trajectory {
            times,
            states,
            sensitivities,
            n_theta,
        }
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn n_times(&self) -> usize {
        self.times.len()
    }

    pub fn n_states(&self) -> usize {
        self.states.ncols()
    }

    pub fn n_theta(&self) -> usize {
        self.n_theta
    }

    /// `n_times x n_states` matrix of states
    pub fn states(&self) -> &M {
        &self.states
    }

    /// State vector at the `i`-th output time
    pub fn state(&self, i: usize) -> V {
        self.states.row(i).transpose()
    }

    /// Component `k` of the state at the `i`-th output time
    pub fn value(&self, i: usize, k: usize) -> f64 {
        self.states[(i, k)]
    }

    pub fn has_sensitivities(&self) -> bool {
        self.sensitivities.is_some()
    }

    /// Full sensitivity matrix `[dy/dtheta | dy/dy0]` at the `i`-th time
    pub fn sensitivity(&self, i: usize) -> Option<&M> {
        self.sensitivities.as_ref().map(|s| &s[i])
    }

    /// `dy/dtheta` at the `i`-th time, `n_states x n_theta`
    pub fn dtheta(&self, i: usize) -> Option<M> {
        self.sensitivity(i)
            .map(|s| s.columns(0, self.n_theta).into_owned())
    }

    /// `dy/dy0` at the `i`-th time, `n_states x n_states`
    pub fn dy0(&self, i: usize) -> Option<M> {
        let n = self.n_states();
        self.sensitivity(i)
            .map(|s| s.columns(self.n_theta, n).into_owned())
    }
}
