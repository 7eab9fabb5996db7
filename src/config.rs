//! Engine configuration.
//!
//! All tunables live in one explicit [`EngineConfig`] passed to the
//! executor at construction. Nothing in the engine reads environment
//! variables or global counters; combined with an injectable
//! [`TagGenerator`](crate::tag::TagGenerator) this keeps runs deterministic
//! enough to test.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity (in items) of every batch allocated by the engine.
    pub batch_capacity: usize,
    /// Capacity (in messages) of every inter-stage channel. Backpressure is
    /// implicit: a producer blocks when a consumer's queue is full.
    pub channel_capacity: usize,
    /// Worker count used by operators constructed with parallelism 0.
    pub default_parallelism: usize,
    /// Upper bound on concurrently in-flight iteration tags in a feedback
    /// loop.
    pub max_inflight_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_capacity: 512,
            channel_capacity: 64,
            default_parallelism: num_cpus::get().max(2),
            max_inflight_iterations: 2,
        }
    }
}

impl EngineConfig {
    /// Resolve an operator's declared parallelism: 0 means "use the default".
    #[inline]
    pub fn resolve_parallelism(&self, declared: usize) -> usize {
        if declared == 0 {
            self.default_parallelism
        } else {
            declared
        }
    }
}
