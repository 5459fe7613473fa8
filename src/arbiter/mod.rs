// C5: arbiter / failure detector.

mod arbiter;
mod clique;
mod status;

pub use arbiter::{Arbiter, ArbiterStats};
pub use clique::{build_adjacency, max_clique};
pub use status::ClusterStatus;
