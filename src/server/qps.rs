use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use super::Server;

/// In-process tap counters per round, drained once a second into the store's
/// per-second buckets. Clicks only pay an atomic add on the hot path.
pub struct QpsCounters {
    counters: DashMap<i64, AtomicI64>,
}

impl Default for QpsCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl QpsCounters {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    pub fn bump(&self, round_id: i64) {
        self.counters
            .entry(round_id)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Swaps every non-zero counter down to zero and returns the drained
    /// totals.
    pub fn drain(&self) -> Vec<(i64, i64)> {
        let mut out = Vec::new();
        for entry in self.counters.iter() {
            let n = entry.value().swap(0, Ordering::Relaxed);
            if n > 0 {
                out.push((*entry.key(), n));
            }
        }
        out
    }
}

pub fn spawn_qps_flusher(srv: Arc<Server>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let drained = srv.qps.drain();
            if drained.is_empty() {
                continue;
            }
            let sec = crate::game::clock::now_ms() / 1000;
            if let Err(err) = srv.store.flush_qps(&drained, sec).await {
                tracing::warn!(%err, "qps flush failed");
            }
        }
    });
}
