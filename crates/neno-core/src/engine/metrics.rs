//! Aggregated engine statistics.

use serde::{Deserialize, Serialize};

use super::kv_cache::KvCacheStats;
use super::scheduler::SchedulerStats;
use super::speculative::SpeculativeStats;

/// One snapshot of engine health: queue depths, KV utilization, and
/// speculation counters when the layer is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub scheduler: SchedulerStats,
    pub kv_cache: KvCacheStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speculation: Option<SpeculativeStats>,
}

impl EngineMetrics {
    /// KV utilization in [0, 1], the headline pressure signal.
    pub fn kv_utilization(&self) -> f64 {
        self.kv_cache.utilization()
    }
}
