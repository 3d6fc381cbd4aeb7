use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::async_tunnel::TunnelTotals;

/// Counters shared by every proxy connection task
#[derive(Debug, Default)]
pub struct ConnectionStats {
    active: AtomicU32,
    total: AtomicU64,
    failed: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub active: u32,
    pub total: u64,
    pub failed: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl ConnectionStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_opened(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay(&self, totals: TunnelTotals) {
        self.bytes_in.fetch_add(totals.bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(totals.bytes_out, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active: self.active.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let s = self.snapshot();
        debug!(
            "[stats] active={} total={} failed={} bytes_in={:.1}KB bytes_out={:.1}KB",
            s.active,
            s.total,
            s.failed,
            s.bytes_in as f64 / 1024.0,
            s.bytes_out as f64 / 1024.0
        );
    }
}
