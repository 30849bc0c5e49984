//! Coordinator side of the engine: planning a run and driving it through
//! split, map, reduce and gather.

pub mod core;
pub mod load;
pub mod plan;

pub use crate::core::{Coordinator, RunReport};
pub use plan::{JobConfig, Plan};
