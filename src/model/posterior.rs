use rand::rngs::StdRng;

use crate::error::{ConfigError, OdeFitError};
use crate::likelihood::LikelihoodBinder;
use crate::model::binding::{Binding, Input};
use crate::model::prior::Prior;
use crate::model::transform::Transform;
use crate::sampler::LogDensity;
use crate::simulator::{OdeProblem, Trajectory, VectorField};

#[derive(Debug, Clone)]
struct Parameter {
    name: String,
    prior: Prior,
    transform: Transform,
    /// Cached [Prior::log_mass]
    log_mass: f64,
}

/// The ODE inputs for one point in constrained parameter space
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInputs {
    pub theta: Vec<f64>,
    pub y0: Vec<f64>,
    pub sigma: Vec<f64>,
}

/// A posterior over named free parameters
///
/// Every `theta`, `y0` and noise-scale slot of the problem is bound to a free
/// parameter, a constant or a product of two parameters. The sampler works in
/// unconstrained space; each parameter is mapped to the support of its prior
/// and the log-Jacobian of that map is part of the density.
#[derive(Debug, Clone)]
pub struct BayesianOdeModel<F: VectorField> {
    problem: OdeProblem<F>,
    parameters: Vec<Parameter>,
    theta: Vec<Input>,
    y0: Vec<Input>,
    sigma: Vec<Input>,
    derived: Vec<(String, Input)>,
    likelihood: Option<LikelihoodBinder>,
}

pub struct BayesianOdeModelBuilder<F: VectorField> {
    problem: OdeProblem<F>,
    parameters: Vec<(String, Prior)>,
    theta: Vec<Binding>,
    y0: Vec<Binding>,
    sigma: Vec<Binding>,
    derived: Vec<(String, Binding)>,
    likelihood: Option<LikelihoodBinder>,
}

impl<F: VectorField> BayesianOdeModelBuilder<F> {
    /// Declare a free parameter
    pub fn parameter(mut self, name: impl Into<String>, prior: Prior) -> Self {
        self.parameters.push((name.into(), prior));
        self
    }

    pub fn theta(mut self, bindings: Vec<Binding>) -> Self {
        self.theta = bindings;
        self
    }

    pub fn initial_state(mut self, bindings: Vec<Binding>) -> Self {
        self.y0 = bindings;
        self
    }

    /// One scale per observed column
    pub fn noise_scale(mut self, bindings: Vec<Binding>) -> Self {
        self.sigma = bindings;
        self
    }

    /// A quantity reported alongside the parameters in every draw
    pub fn deterministic(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.derived.push((name.into(), binding));
        self
    }

    pub fn likelihood(mut self, binder: LikelihoodBinder) -> Self {
        self.likelihood = Some(binder);
        self
    }

    pub fn build(self) -> Result<BayesianOdeModel<F>, ConfigError> {
        let mut parameters: Vec<Parameter> = Vec::with_capacity(self.parameters.len());
        for (name, prior) in self.parameters {
            if parameters.iter().any(|p| p.name == name) {
                return Err(ConfigError::DuplicateParameter(name));
            }
            prior.validate(&name)?;
            parameters.push(Parameter {
                transform: prior.transform(),
                log_mass: prior.log_mass(),
                name,
                prior,
            });
        }
        if parameters.is_empty() {
            return Err(ConfigError::invalid(
                "parameters",
                "at least one free parameter is required",
            ));
        }
        let names: Vec<String> = parameters.iter().map(|p| p.name.clone()).collect();

        let resolve = |what: &str,
                       bindings: &[Binding],
                       expected: usize|
         -> Result<Vec<Input>, ConfigError> {
            if bindings.len() != expected {
                return Err(ConfigError::mismatch(what, expected, bindings.len()));
            }
            bindings.iter().map(|b| b.resolve(&names)).collect()
        };
        let theta: Vec<Input> = resolve("theta bindings", &self.theta, self.problem.n_theta())?;
        let y0: Vec<Input> = resolve("initial state bindings", &self.y0, self.problem.n_states())?;
        let n_columns = self.likelihood.as_ref().map_or(0, |l| l.n_columns());
        let sigma: Vec<Input> = resolve("noise scale bindings", &self.sigma, n_columns)?;
        for input in &sigma {
            if let Input::Fixed(v) = input {
                if !v.is_finite() || *v <= 0.0 {
                    return Err(ConfigError::invalid("noise scale", "fixed scale must be > 0"));
                }
            }
        }

        if let Some(binder) = &self.likelihood {
            binder.check_problem(&self.problem)?;
        }

        let mut derived: Vec<(String, Input)> = Vec::with_capacity(self.derived.len());
        for (name, binding) in self.derived {
            if names.contains(&name) || derived.iter().any(|(n, _)| *n == name) {
                return Err(ConfigError::DuplicateParameter(name));
            }
            let input = binding.resolve(&names)?;
            derived.push((name, input));
        }

        Ok(BayesianOdeModel {
            problem: self.problem,
            parameters,
            theta,
            y0,
            sigma,
            derived,
            likelihood: self.likelihood,
        })
    }
}

impl<F: VectorField> BayesianOdeModel<F> {
    pub fn builder(problem: OdeProblem<F>) -> BayesianOdeModelBuilder<F> {
        BayesianOdeModelBuilder {
            problem,
            parameters: Vec::new(),
            theta: Vec::new(),
            y0: Vec::new(),
            sigma: Vec::new(),
            derived: Vec::new(),
            likelihood: None,
        }
    }

    pub fn problem(&self) -> &OdeProblem<F> {
        &self.problem
    }

    pub fn likelihood(&self) -> Option<&LikelihoodBinder> {
        self.likelihood.as_ref()
    }

    pub fn prior(&self, name: &str) -> Option<&Prior> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.prior)
    }

    /// Resolve the bindings at a constrained point
    pub fn inputs(&self, x: &[f64]) -> ModelInputs {
        let eval = |inputs: &[Input]| -> Vec<f64> { inputs.iter().map(|i| i.value(x)).collect() };
        ModelInputs {
            theta: eval(&self.theta),
            y0: eval(&self.y0),
            sigma: eval(&self.sigma),
        }
    }

    /// States at the problem's output times for a constrained point
    pub fn simulate(&self, x: &[f64]) -> Result<Trajectory, OdeFitError> {
        self.check_len(x)?;
        let inputs = self.inputs(x);
        self.problem.simulate(&inputs.y0, &inputs.theta)
    }

    fn check_len(&self, values: &[f64]) -> Result<(), ConfigError> {
        if values.len() != self.parameters.len() {
            return Err(ConfigError::mismatch(
                "parameter vector",
                self.parameters.len(),
                values.len(),
            ));
        }
        Ok(())
    }

    /// Prior plus log-Jacobian, in unconstrained space
    fn log_prior(&self, z: &[f64], x: &[f64]) -> f64 {
        self.parameters
            .iter()
            .zip(z.iter().zip(x))
            .map(|(p, (&z, &x))| {
                p.prior.log_density_with_mass(x, p.log_mass) + p.transform.log_abs_jacobian(z)
            })
            .sum()
    }
}

impl<F: VectorField> LogDensity for BayesianOdeModel<F> {
    fn dim(&self) -> usize {
        self.parameters.len()
    }

    fn parameter_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    fn logp_and_grad(&self, z: &[f64], grad: &mut [f64]) -> Result<f64, OdeFitError> {
        self.check_len(z)?;
        self.check_len(grad)?;
        let x = self.to_constrained(z);

        let mut lp = self.log_prior(z, &x);
        if !lp.is_finite() {
            grad.fill(0.0);
            return Ok(f64::NEG_INFINITY);
        }
        let mut gx: Vec<f64> = self
            .parameters
            .iter()
            .zip(&x)
            .map(|(p, &x)| p.prior.grad_log_density(x))
            .collect();

        if let Some(binder) = &self.likelihood {
            let inputs = self.inputs(&x);
            let traj = self.problem.solve(&inputs.y0, &inputs.theta)?;
            let ll = binder.log_likelihood_with_gradient(&traj, &inputs.sigma)?;
            if !ll.value.is_finite() {
                grad.fill(0.0);
                return Ok(f64::NEG_INFINITY);
            }
            lp += ll.value;
            for (input, g) in self.theta.iter().zip(&ll.d_theta) {
                input.accumulate(*g, &x, &mut gx);
            }
            for (input, g) in self.y0.iter().zip(&ll.d_y0) {
                input.accumulate(*g, &x, &mut gx);
            }
            for (input, g) in self.sigma.iter().zip(&ll.d_sigma) {
                input.accumulate(*g, &x, &mut gx);
            }
        }

        for (i, p) in self.parameters.iter().enumerate() {
            grad[i] = gx[i] * p.transform.dx_dz(z[i]) + p.transform.grad_log_abs_jacobian(z[i]);
        }
        Ok(lp)
    }

    fn logp(&self, z: &[f64]) -> Result<f64, OdeFitError> {
        self.check_len(z)?;
        let x = self.to_constrained(z);
        let mut lp = self.log_prior(z, &x);
        if !lp.is_finite() {
            return Ok(f64::NEG_INFINITY);
        }
        if let Some(binder) = &self.likelihood {
            let inputs = self.inputs(&x);
            let traj = self.problem.simulate(&inputs.y0, &inputs.theta)?;
            lp += binder.log_likelihood(&traj, &inputs.sigma)?;
        }
        Ok(lp)
    }

    fn to_constrained(&self, z: &[f64]) -> Vec<f64> {
        self.parameters
            .iter()
            .zip(z)
            .map(|(p, &z)| p.transform.forward(z))
            .collect()
    }

    fn to_unconstrained(&self, x: &[f64]) -> Vec<f64> {
        self.parameters
            .iter()
            .zip(x)
            .map(|(p, &x)| p.transform.inverse(x))
            .collect()
    }

    fn default_point(&self) -> Vec<f64> {
        self.parameters
            .iter()
            .map(|p| p.transform.inverse(p.prior.median()))
            .collect()
    }

    fn initial_point(&self, rng: &mut StdRng) -> Vec<f64> {
        self.parameters
            .iter()
            .map(|p| p.transform.inverse(p.prior.sample(rng)))
            .collect()
    }

    fn derived_names(&self) -> Vec<String> {
        self.derived.iter().map(|(name, _)| name.clone()).collect()
    }

    fn derived(&self, x: &[f64]) -> Vec<f64> {
        self.derived.iter().map(|(_, input)| input.value(x)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Observations;
    use crate::likelihood::NoiseModel;
    use crate::simulator::{FreeFall, Sir, SolverOptions};
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    fn problem() -> OdeProblem<FreeFall> {
        OdeProblem::builder(FreeFall::default())
            .times(&[0.5, 1.0, 1.5, 2.0])
            .options(SolverOptions::default().with_tolerances(1e-12, 1e-12))
            .build()
            .unwrap()
    }

    fn observations() -> Observations {
        Observations::builder()
            .column("v")
            .row(0.5, &[3.1])
            .row(1.0, &[6.4])
            .missing_row(1.5)
            .row(2.0, &[11.2])
            .build()
            .unwrap()
    }

    fn model() -> BayesianOdeModel<FreeFall> {
        let problem = problem();
        let binder =
            LikelihoodBinder::identity(&problem, observations(), NoiseModel::Gaussian).unwrap();
        BayesianOdeModel::builder(problem)
            .parameter("gamma", Prior::half_normal(2.0))
            .parameter("y0", Prior::normal(0.0, 2.0))
            .parameter("sigma", Prior::half_cauchy(1.0))
            .parameter("g", Prior::uniform(5.0, 15.0))
            .theta(vec![Binding::free("gamma"), Binding::free("g")])
            .initial_state(vec![Binding::free("y0")])
            .noise_scale(vec![Binding::free("sigma")])
            .deterministic("terminal", Binding::product("g", "g"))
            .likelihood(binder)
            .build()
            .unwrap()
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let model = model();
        let z = model.to_unconstrained(&[0.6, 0.3, 0.8, 9.0]);
        let mut grad = vec![0.0; 4];
        let lp = model.logp_and_grad(&z, &mut grad).unwrap();
        assert_relative_eq!(lp, model.logp(&z).unwrap(), epsilon = 1e-8);

        let h = 1e-6;
        for i in 0..4 {
            let mut up = z.clone();
            let mut down = z.clone();
            up[i] += h;
            down[i] -= h;
            let fd = (model.logp(&up).unwrap() - model.logp(&down).unwrap()) / (2.0 * h);
            assert_relative_eq!(grad[i], fd, epsilon = 1e-5, max_relative = 1e-4);
        }
    }

    #[test]
    fn constrained_round_trip_and_derived() {
        let model = model();
        let x = vec![0.6, -1.0, 0.8, 9.0];
        let back = model.to_constrained(&model.to_unconstrained(&x));
        for (a, b) in x.iter().zip(&back) {
            assert_relative_eq!(a, b, epsilon = 1e-10);
        }
        assert_eq!(model.derived_names(), vec!["terminal".to_string()]);
        assert_relative_eq!(model.derived(&x)[0], 81.0);
        let inputs = model.inputs(&x);
        assert_eq!(inputs.theta, vec![0.6, 9.0]);
        assert_eq!(inputs.y0, vec![-1.0]);
        assert_eq!(inputs.sigma, vec![0.8]);
    }

    #[test]
    fn initial_points_are_inside_the_support() {
        let model = model();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let z = model.initial_point(&mut rng);
            assert!(model.logp(&z).unwrap().is_finite());
        }
        assert!(model.logp(&model.default_point()).unwrap().is_finite());
    }

    #[test]
    fn prior_only_model_needs_no_noise_scale() {
        let model = BayesianOdeModel::builder(problem())
            .parameter("gamma", Prior::half_normal(1.0))
            .theta(vec![Binding::free("gamma"), Binding::fixed(9.8)])
            .initial_state(vec![Binding::fixed(0.0)])
            .build()
            .unwrap();
        let z = [0.3];
        let mut grad = [0.0];
        let lp = model.logp_and_grad(&z, &mut grad).unwrap();
        // half-normal on exp(z) plus the log-Jacobian z
        let x = 0.3f64.exp();
        let expected = (2.0 / std::f64::consts::PI).sqrt().ln() - 0.5 * x * x + 0.3;
        assert_relative_eq!(lp, expected, epsilon = 1e-12);
        assert_relative_eq!(grad[0], -x * x + 1.0, epsilon = 1e-12);
    }

    #[test]
    fn configuration_errors() {
        let err = BayesianOdeModel::builder(problem())
            .parameter("a", Prior::normal(0.0, 1.0))
            .parameter("a", Prior::normal(0.0, 1.0))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateParameter("a".into()));

        let err = BayesianOdeModel::builder(problem())
            .parameter("a", Prior::normal(0.0, 1.0))
            .theta(vec![Binding::free("a"), Binding::free("b")])
            .initial_state(vec![Binding::fixed(0.0)])
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownParameter("b".into()));

        let err = BayesianOdeModel::builder(problem())
            .parameter("a", Prior::normal(0.0, 1.0))
            .theta(vec![Binding::free("a")])
            .initial_state(vec![Binding::fixed(0.0)])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DimensionMismatch { .. }));

        let err = BayesianOdeModel::builder(problem())
            .theta(vec![Binding::fixed(0.5), Binding::fixed(9.8)])
            .initial_state(vec![Binding::fixed(0.0)])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let p = problem();
        let binder = LikelihoodBinder::identity(&p, observations(), NoiseModel::Gaussian).unwrap();
        let err = BayesianOdeModel::builder(p)
            .parameter("a", Prior::half_normal(1.0))
            .theta(vec![Binding::free("a"), Binding::fixed(9.8)])
            .initial_state(vec![Binding::fixed(0.0)])
            .noise_scale(vec![Binding::fixed(0.0)])
            .likelihood(binder)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn non_finite_fixed_scale_is_rejected() {
        for scale in [f64::NAN, f64::INFINITY] {
            let p = problem();
            let binder =
                LikelihoodBinder::identity(&p, observations(), NoiseModel::Gaussian).unwrap();
            let err = BayesianOdeModel::builder(p)
                .parameter("a", Prior::half_normal(1.0))
                .theta(vec![Binding::free("a"), Binding::fixed(9.8)])
                .initial_state(vec![Binding::fixed(0.0)])
                .noise_scale(vec![Binding::fixed(scale)])
                .likelihood(binder)
                .build()
                .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }), "{err:?}");
        }
    }

    #[test]
    fn likelihood_bound_to_another_problem_is_rejected() {
        let sir = OdeProblem::builder(Sir)
            .times(&[0.5, 1.0, 1.5, 2.0])
            .build()
            .unwrap();
        let obs = Observations::builder()
            .column("S")
            .column("I")
            .row(0.5, &[0.9, 0.1])
            .row(1.0, &[0.8, 0.2])
            .row(1.5, &[0.7, 0.25])
            .row(2.0, &[0.6, 0.3])
            .build()
            .unwrap();
        let binder = LikelihoodBinder::identity(&sir, obs, NoiseModel::Gaussian).unwrap();

        // Same output times, but bound to a two-state model
        let err = BayesianOdeModel::builder(problem())
            .parameter("a", Prior::half_normal(1.0))
            .theta(vec![Binding::free("a"), Binding::fixed(9.8)])
            .initial_state(vec![Binding::fixed(0.0)])
            .noise_scale(vec![Binding::fixed(1.0), Binding::fixed(1.0)])
            .likelihood(binder)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DimensionMismatch { .. }), "{err:?}");
    }

    #[test]
    fn likelihood_with_shifted_times_is_rejected() {
        let shifted = OdeProblem::builder(FreeFall::default())
            .times(&[0.5, 1.0, 1.25, 2.0])
            .build()
            .unwrap();
        let obs = Observations::builder()
            .column("v")
            .row(0.5, &[3.1])
            .row(1.0, &[6.4])
            .row(1.25, &[8.0])
            .row(2.0, &[11.2])
            .build()
            .unwrap();
        let binder = LikelihoodBinder::identity(&shifted, obs, NoiseModel::Gaussian).unwrap();
        let err = BayesianOdeModel::builder(problem())
            .parameter("a", Prior::half_normal(1.0))
            .theta(vec![Binding::free("a"), Binding::fixed(9.8)])
            .initial_state(vec![Binding::fixed(0.0)])
            .noise_scale(vec![Binding::fixed(1.0)])
            .likelihood(binder)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::TimeMismatch {
                index: 2,
                expected: 1.5,
                got: 1.25
            }
        );
    }

    #[test]
    fn truncated_normal_prior_uses_the_cached_mass() {
        let prior = Prior::truncated_normal(1.0, 0.5, Some(0.0), Some(2.0));
        let model = BayesianOdeModel::builder(problem())
            .parameter("gamma", prior.clone())
            .theta(vec![Binding::free("gamma"), Binding::fixed(9.8)])
            .initial_state(vec![Binding::fixed(0.0)])
            .build()
            .unwrap();
        let x = 0.7;
        let z = model.to_unconstrained(&[x]);
        let expected = prior.log_density(x) + prior.transform().log_abs_jacobian(z[0]);
        assert_relative_eq!(model.logp(&z).unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn failed_solve_is_recoverable() {
        // two steps cannot reach t = 100
        let problem = OdeProblem::builder(FreeFall::default())
            .times(&[100.0])
            .options(SolverOptions::default().with_max_steps(2))
            .build()
            .unwrap();
        let obs = Observations::builder()
            .column("v")
            .row(100.0, &[50.0])
            .build()
            .unwrap();
        let binder = LikelihoodBinder::identity(&problem, obs, NoiseModel::Gaussian).unwrap();
        let model = BayesianOdeModel::builder(problem)
            .parameter("gamma", Prior::half_normal(1.0))
            .theta(vec![Binding::free("gamma"), Binding::fixed(9.8)])
            .initial_state(vec![Binding::fixed(0.0)])
            .noise_scale(vec![Binding::fixed(1.0)])
            .likelihood(binder)
            .build()
            .unwrap();
        let mut grad = [0.0];
        let err = model.logp_and_grad(&[0.0], &mut grad).unwrap_err();
        assert!(err.is_recoverable());
    }
}
