use serde::{Deserialize, Serialize};

/// Configuration of the per-node collect execution core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectConfig {
    /// Worker threads of the short-request `get` pool.
    pub get_pool_threads: usize,
    /// Worker threads of the long-running `search` pool.
    pub search_pool_threads: usize,
    /// Bounded queue depth per pool. When full, submissions are rejected.
    pub pool_queue_capacity: usize,
    /// Per-phase memory budget in bytes. 0 = unlimited.
    #[serde(default)]
    pub phase_ram_limit_bytes: u64,
}

impl Default for CollectConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            get_pool_threads: cpus.min(8),
            search_pool_threads: cpus,
            pool_queue_capacity: 1_000,
            phase_ram_limit_bytes: 0,
        }
    }
}
