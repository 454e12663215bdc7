//! Runtime counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight counters kept by the hive and its bees.
#[derive(Debug, Default)]
pub struct HiveStats {
    pub msgs_routed: AtomicU64,
    pub msgs_forwarded: AtomicU64,
    pub bees_spawned: AtomicU64,
    pub txs_committed: AtomicU64,
    pub txs_aborted: AtomicU64,
    pub replication_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HiveStatsSnapshot {
    pub msgs_routed: u64,
    pub msgs_forwarded: u64,
    pub bees_spawned: u64,
    pub txs_committed: u64,
    pub txs_aborted: u64,
    pub replication_failures: u64,
}

impl HiveStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HiveStatsSnapshot {
        HiveStatsSnapshot {
            msgs_routed: self.msgs_routed.load(Ordering::Relaxed),
            msgs_forwarded: self.msgs_forwarded.load(Ordering::Relaxed),
            bees_spawned: self.bees_spawned.load(Ordering::Relaxed),
            txs_committed: self.txs_committed.load(Ordering::Relaxed),
            txs_aborted: self.txs_aborted.load(Ordering::Relaxed),
            replication_failures: self.replication_failures.load(Ordering::Relaxed),
        }
    }
}
