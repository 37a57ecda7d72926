//! Bayesian model layer: priors on named free parameters, their bindings to
//! the ODE inputs, and the resulting posterior density.
pub mod binding;
pub mod posterior;
pub mod prior;
pub mod transform;

pub use binding::Binding;
pub use posterior::{BayesianOdeModel, BayesianOdeModelBuilder, ModelInputs};
pub use prior::Prior;
pub use transform::Transform;
