//! Posterior mode search, used to start chains.
pub mod map;

pub use map::{find_map, MapEstimate};
