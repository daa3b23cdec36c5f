use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitmapConfig {
    pub enabled: bool,
    /// Pending recompute jobs allowed per tenant before coalescing kicks in.
    pub queue_capacity_per_tenant: usize,
    pub worker_count: usize,
    /// Failed jobs retry up to this many attempts, then park.
    pub retry_cap: u32,
    /// `processing` entries older than this are requeued by the reaper.
    pub reap_after_ms: u64,
    /// Worker idle poll interval.
    pub poll_interval_ms: u64,
}

impl Default for BitmapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity_per_tenant: 1_000,
            worker_count: 2,
            retry_cap: 3,
            reap_after_ms: 60_000,
            poll_interval_ms: 50,
        }
    }
}
