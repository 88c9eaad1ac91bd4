use std::collections::HashMap;
use tokio::sync::RwLock;

/// One GPU as reported by `nvidia-smi`. `usage_percentage` is always
/// derived from used/total at parse time.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct GpuMetric {
    pub name: String,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub usage_percentage: f64,
}

/// Most recent reading for one host. Metrics a cycle failed to collect
/// fall back to zero values; a cycle where everything failed leaves the
/// previously published status in place instead.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct HostStatus {
    pub cpu_usage_percentage: f64,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percentage: f64,
    pub gpus: Vec<GpuMetric>,
}

pub type StatusMap = HashMap<String, HostStatus>;

/// Process-wide holder of the latest per-host status map. The poller is
/// the only writer; readers always get an owned copy of a fully merged
/// cycle, never a view into one in progress.
#[derive(Debug, Default)]
pub struct StatusStore {
    inner: RwLock<StatusMap>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one cycle's successful results under a single write lock.
    /// Hosts absent from `updates` keep their last published status.
    pub async fn publish(&self, updates: StatusMap) {
        if updates.is_empty() {
            return;
        }
        let mut map = self.inner.write().await;
        for (host, status) in updates {
            map.insert(host, status);
        }
    }

    /// Returns the current aggregate map by value. Never fails; empty
    /// before the first successful cycle.
    pub async fn snapshot(&self) -> StatusMap {
        self.inner.read().await.clone()
    }
}
