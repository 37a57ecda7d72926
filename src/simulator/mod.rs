//! ODE models and the sensitivity-augmented integrator.
//!
//! A model implements [VectorField]. An [OdeProblem] couples the field to an
//! initial time, a set of output times and solver options, and solves for
//! the states and their sensitivities with respect to the parameters and the
//! initial condition.
pub mod field;
pub mod integrator;
pub mod problem;
pub mod trajectory;

pub use field::closure::{ClosureField, Jacobian, Rhs};
pub use field::models::{FreeFall, Sir};
pub use field::VectorField;
pub use integrator::{IntegrationError, Method, SolverOptions};
pub use problem::{OdeProblem, OdeProblemBuilder};
pub use trajectory::Trajectory;

pub type T = f64;
pub type V = nalgebra::DVector<T>;
pub type M = nalgebra::DMatrix<T>;
