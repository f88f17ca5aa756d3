//! The caching and invalidation subsystem: per-worker store, mutation →
//! key-set planning, and cluster-coherent acknowledged invalidation.

pub mod bus;
pub mod planner;
pub mod store;

pub use bus::{BusAck, ClusterBus, LocalBus, RedisBus};
pub use planner::InvalidationPlan;
pub use store::{CacheMetrics, CacheStore};
