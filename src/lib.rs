pub mod data;
pub mod error;
pub mod likelihood;
pub mod model;
pub mod optimize;
pub mod sampler;
pub mod simulator;

pub use crate::data::{Observations, ObservationsBuilder};
pub use crate::likelihood::{LikelihoodBinder, NoiseModel};
pub use crate::model::{BayesianOdeModel, Binding, Prior, Transform};
pub use crate::optimize::{find_map, MapEstimate};
pub use crate::sampler::{
    sample, sample_with_cancellation, CancellationToken, InitStrategy, LogDensity, SamplerConfig,
};
pub use crate::simulator::{Method, OdeProblem, SolverOptions, Trajectory, VectorField};
pub use error::{ConfigError, OdeFitError};
pub use nalgebra::dmatrix;

pub mod prelude {
    pub mod data {
        pub use crate::data::{parser::read_observations, Observations, ObservationsBuilder};
    }
    pub mod simulator {
        pub use crate::simulator::{
            ClosureField, Jacobian, Method, OdeProblem, Rhs, SolverOptions, Trajectory,
            VectorField, M, T, V,
        };
    }
    pub mod models {
        pub use crate::simulator::field::models::{FreeFall, Sir};
    }

    pub use crate::data::{Observations, ObservationsBuilder};
    pub use crate::likelihood::{LikelihoodBinder, NoiseModel};
    pub use crate::model::{BayesianOdeModel, Binding, Prior, Transform};
    pub use crate::sampler::chain::SamplerResult;
    pub use crate::sampler::{sample, InitStrategy, LogDensity, SamplerConfig};
    pub use crate::simulator::{ClosureField, OdeProblem, SolverOptions, VectorField};
    pub use crate::{ConfigError, OdeFitError};

    #[macro_export]
    macro_rules! fetch_params {
        ($p:expr, $($name:ident),*) => {
            let p = $p;
            let mut idx = 0;
            $(
                #[allow(unused_mut)]
                let mut $name = p[idx];
                idx += 1;
            )*
            let _ = idx;
        };
    }
}
