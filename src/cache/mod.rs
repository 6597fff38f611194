//! In-memory caches shared by every repository a service touches.
//!
//! - `result`: command output keyed by repository and signature, invalidated by operation class
//! - `bounded`: generic LRU bounded by item count and memory
//! - `graph`: commit graphs on top of `bounded`
//! - `flight`: single-flight coalescing used by both

pub mod bounded;
pub mod flight;
pub mod graph;
pub mod result;

pub use bounded::{BoundedCache, BoundedStats};
pub use graph::{CommitGraph, GraphCache, GraphConfig, GraphKey};
pub use result::{CacheConfig, CacheStatistics, CommandCache};
