//! Worker side of the engine: splitting, shuffling, map and reduce tasks.

pub mod core;
pub mod exchange;
pub mod map;
pub mod merge;
pub mod reduce;
pub mod split;

pub use crate::core::{blocking, Progress, Worker};
pub use exchange::{FetchConfig, Fetcher};
pub use map::{perform_map, MapSummary};
pub use merge::{merge, StoreRef};
pub use reduce::{perform_reduce, ReduceSummary};
pub use split::split;
