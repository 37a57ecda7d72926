//! Multinomial No-U-Turn transitions.
//!
//! Trees are doubled in a random direction until the trajectory turns back on
//! itself, the energy error diverges or the maximum depth is reached. Within a
//! subtree states are drawn uniformly in proportion to `exp(-H)`; across
//! doublings the draw is biased toward the newer subtree.

use rand::Rng;

use crate::error::OdeFitError;
use crate::sampler::hmc::{Leapfrog, Metric, PhaseState};
use crate::sampler::LogDensity;

/// Energy error beyond which a trajectory is declared divergent
pub(crate) const DIVERGENCE_THRESHOLD: f64 = 1000.0;

/// Outcome of one transition
#[derive(Debug, Clone)]
pub(crate) struct Transition {
    pub state: PhaseState,
    pub depth: usize,
    pub n_leapfrog: usize,
    pub divergent: bool,
    pub accept_prob: f64,
    pub energy: f64,
}

struct Tree {
    left: PhaseState,
    right: PhaseState,
    proposal: PhaseState,
    /// Sum of the momenta over the whole subtree
    rho: Vec<f64>,
    log_sum_weight: f64,
    n_leapfrog: usize,
    sum_accept_prob: f64,
    divergent: bool,
    turning: bool,
}

impl Tree {
    fn edge(&self, direction: f64) -> &PhaseState {
        if direction > 0.0 {
            &self.right
        } else {
            &self.left
        }
    }

    fn set_edge(&mut self, direction: f64, state: PhaseState) {
        if direction > 0.0 {
            self.right = state;
        } else {
            self.left = state;
        }
    }
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        f64::NEG_INFINITY
    } else {
        max + ((a - max).exp() + (b - max).exp()).ln()
    }
}

/// Generalized U-turn criterion: the trajectory with momentum sum `rho`
/// turns when the velocity at either end has a non-positive projection on it
fn is_turning(rho: &[f64], p_minus: &[f64], p_plus: &[f64], metric: &Metric) -> bool {
    let project = |p: &[f64]| -> f64 {
        p.iter()
            .zip(metric.inv_mass())
            .zip(rho)
            .map(|((p, m), r)| p * m * r)
            .sum()
    };
    project(p_minus) <= 0.0 || project(p_plus) <= 0.0
}

fn sum(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(a, b)| a + b).collect()
}

/// U-turn checks for the union of two adjacent subtrees, `left` preceding
/// `right` in time. Besides the merged trajectory, each subtree is extended
/// by the nearest state of the other, which catches turns that happen
/// across the seam.
fn subtrees_turn(left: &Tree, right: &Tree, metric: &Metric) -> bool {
    let rho = sum(&left.rho, &right.rho);
    if is_turning(&rho, &left.left.p, &right.right.p, metric) {
        return true;
    }
    let rho_left = sum(&left.rho, &right.left.p);
    if is_turning(&rho_left, &left.left.p, &right.left.p, metric) {
        return true;
    }
    let rho_right = sum(&right.rho, &left.right.p);
    is_turning(&rho_right, &left.right.p, &right.right.p, metric)
}

/// Fold `outer`, built further along `direction`, into `tree`
fn merge<R: Rng>(
    tree: &mut Tree,
    outer: Tree,
    direction: f64,
    log_sum_weight: f64,
    accept_log_prob: f64,
    metric: &Metric,
    rng: &mut R,
) -> bool {
    let turning = if direction > 0.0 {
        subtrees_turn(tree, &outer, metric)
    } else {
        subtrees_turn(&outer, tree, metric)
    };
    let Tree {
        left,
        right,
        proposal,
        rho,
        ..
    } = outer;
    if rng.random::<f64>() < accept_log_prob.exp() {
        tree.proposal = proposal;
    }
    tree.rho = sum(&tree.rho, &rho);
    tree.log_sum_weight = log_sum_weight;
    tree.set_edge(direction, if direction > 0.0 { right } else { left });
    turning
}

fn build_leaf<D: LogDensity + ?Sized>(
    leapfrog: &Leapfrog<D>,
    from: &PhaseState,
    direction: f64,
    h0: f64,
) -> Result<Tree, OdeFitError> {
    let mut state = from.clone();
    leapfrog.step(&mut state, direction)?;
    let energy_error = state.hamiltonian(leapfrog.metric()) - h0;
    let energy_error = if energy_error.is_nan() {
        f64::INFINITY
    } else {
        energy_error
    };
    Ok(Tree {
        left: state.clone(),
        right: state.clone(),
        rho: state.p.clone(),
        proposal: state,
        log_sum_weight: -energy_error,
        n_leapfrog: 1,
        sum_accept_prob: (-energy_error).exp().min(1.0),
        divergent: energy_error > DIVERGENCE_THRESHOLD,
        turning: false,
    })
}

fn build_tree<D: LogDensity + ?Sized, R: Rng>(
    leapfrog: &Leapfrog<D>,
    from: &PhaseState,
    depth: usize,
    direction: f64,
    h0: f64,
    rng: &mut R,
) -> Result<Tree, OdeFitError> {
    if depth == 0 {
        return build_leaf(leapfrog, from, direction, h0);
    }

    let mut tree = build_tree(leapfrog, from, depth - 1, direction, h0, rng)?;
    if tree.divergent || tree.turning {
        return Ok(tree);
    }

    let outer = build_tree(leapfrog, tree.edge(direction), depth - 1, direction, h0, rng)?;
    tree.n_leapfrog += outer.n_leapfrog;
    tree.sum_accept_prob += outer.sum_accept_prob;
    if outer.divergent || outer.turning {
        tree.divergent |= outer.divergent;
        tree.turning |= outer.turning;
        return Ok(tree);
    }

    let log_sum_weight = log_sum_exp(tree.log_sum_weight, outer.log_sum_weight);
    let accept = outer.log_sum_weight - log_sum_weight;
    let turning = merge(
        &mut tree,
        outer,
        direction,
        log_sum_weight,
        accept,
        leapfrog.metric(),
        rng,
    );
    tree.turning = turning;
    Ok(tree)
}

/// One NUTS transition from `current`, whose momentum is resampled
pub(crate) fn transition<D: LogDensity + ?Sized, R: Rng>(
    leapfrog: &Leapfrog<D>,
    current: &PhaseState,
    max_treedepth: usize,
    rng: &mut R,
) -> Result<Transition, OdeFitError> {
    let metric = leapfrog.metric();
    let mut start = current.clone();
    start.p = metric.sample_momentum(rng);
    let h0 = start.hamiltonian(metric);

    let mut tree = Tree {
        left: start.clone(),
        right: start.clone(),
        rho: start.p.clone(),
        proposal: start,
        log_sum_weight: 0.0,
        n_leapfrog: 0,
        sum_accept_prob: 0.0,
        divergent: false,
        turning: false,
    };

    let mut depth = 0;
    while depth < max_treedepth {
        let direction = if rng.random::<bool>() { 1.0 } else { -1.0 };
        let subtree = build_tree(leapfrog, tree.edge(direction), depth, direction, h0, rng)?;
        tree.n_leapfrog += subtree.n_leapfrog;
        tree.sum_accept_prob += subtree.sum_accept_prob;
        depth += 1;

        if subtree.divergent {
            tree.divergent = true;
            break;
        }
        if subtree.turning {
            break;
        }

        // Biased progressive sampling toward the new subtree
        let accept = subtree.log_sum_weight - tree.log_sum_weight;
        let log_sum_weight = log_sum_exp(tree.log_sum_weight, subtree.log_sum_weight);
        if merge(
            &mut tree,
            subtree,
            direction,
            log_sum_weight,
            accept,
            metric,
            rng,
        ) {
            break;
        }
    }

    let energy = tree.proposal.hamiltonian(metric);
    Ok(Transition {
        state: tree.proposal,
        depth,
        n_leapfrog: tree.n_leapfrog,
        divergent: tree.divergent,
        accept_prob: tree.sum_accept_prob / tree.n_leapfrog.max(1) as f64,
        energy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::tests::StdNormal;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn transitions_explore_a_standard_normal() {
        let density = StdNormal::new(2);
        let leapfrog = Leapfrog::new(&density, 0.5, Metric::identity(2));
        let mut rng = StdRng::seed_from_u64(11);
        let mut state = leapfrog.init_state(vec![0.0, 0.0]).unwrap();

        let n = 4000;
        let (mut sum, mut sum_sq, mut accept) = (0.0, 0.0, 0.0);
        for _ in 0..n {
            let t = transition(&leapfrog, &state, 10, &mut rng).unwrap();
            assert!(!t.divergent);
            assert!(t.depth >= 1 && t.n_leapfrog >= 1);
            accept += t.accept_prob;
            state = t.state;
            sum += state.q[0];
            sum_sq += state.q[0] * state.q[0];
        }
        let mean = sum / n as f64;
        let var = sum_sq / n as f64 - mean * mean;
        assert!(mean.abs() < 0.1, "mean {mean}");
        assert!((var - 1.0).abs() < 0.15, "variance {var}");
        assert!(accept / n as f64 > 0.7);
    }

    #[test]
    fn huge_steps_diverge() {
        let density = StdNormal::new(1);
        let leapfrog = Leapfrog::new(&density, 200.0, Metric::identity(1));
        let mut rng = StdRng::seed_from_u64(1);
        let state = leapfrog.init_state(vec![1.0]).unwrap();
        let t = transition(&leapfrog, &state, 10, &mut rng).unwrap();
        assert!(t.divergent);
        assert_eq!(t.state.q, vec![1.0]);
    }

    /// Two-state subtree with the given momenta and positions at the origin
    fn pair(first: [f64; 2], second: [f64; 2]) -> Tree {
        let state = |p: [f64; 2]| PhaseState {
            q: vec![0.0, 0.0],
            p: p.to_vec(),
            potential: 0.0,
            grad_potential: vec![0.0, 0.0],
        };
        Tree {
            left: state(first),
            right: state(second),
            proposal: state(first),
            rho: sum(&first, &second),
            log_sum_weight: 0.0,
            n_leapfrog: 2,
            sum_accept_prob: 2.0,
            divergent: false,
            turning: false,
        }
    }

    #[test]
    fn turn_across_the_seam_of_two_subtrees_is_caught() {
        let metric = Metric::identity(2);
        let left = pair([1.0, 0.0], [1.0, 0.0]);
        let right = pair([-1.0, 0.5], [0.5, 3.0]);

        // Neither subtree turns on its own and the merged ends agree with
        // the total momentum
        assert!(!is_turning(&left.rho, &left.left.p, &left.right.p, &metric));
        assert!(!is_turning(&right.rho, &right.left.p, &right.right.p, &metric));
        let rho = sum(&left.rho, &right.rho);
        assert!(!is_turning(&rho, &left.left.p, &right.right.p, &metric));

        // The left subtree extended by the first state of the right one turns
        assert!(subtrees_turn(&left, &right, &metric));
    }

    #[test]
    fn straight_trajectories_do_not_turn() {
        let metric = Metric::identity(2);
        let left = pair([1.0, 0.2], [1.0, 0.1]);
        let right = pair([0.9, 0.0], [0.8, -0.1]);
        assert!(!subtrees_turn(&left, &right, &metric));
    }

    #[test]
    fn depth_is_capped() {
        let density = StdNormal::new(1);
        let leapfrog = Leapfrog::new(&density, 1e-3, Metric::identity(1));
        let mut rng = StdRng::seed_from_u64(5);
        let state = leapfrog.init_state(vec![0.5]).unwrap();
        let t = transition(&leapfrog, &state, 3, &mut rng).unwrap();
        assert_eq!(t.depth, 3);
        assert_eq!(t.n_leapfrog, 7);
    }
}
