//! Pipeline counters exposed on `/stats` and in the shutdown log

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline counters
#[derive(Debug, Default)]
pub struct OracleStats {
    pub ticks: AtomicU64,
    pub events_seen: AtomicU64,
    pub admitted: AtomicU64,
    pub duplicates: AtomicU64,
    pub source_errors: AtomicU64,
    pub approved: AtomicU64,
    pub rejected: AtomicU64,
    pub confirmed: AtomicU64,
    pub already_processed: AtomicU64,
    pub failed: AtomicU64,
    pub submission_retries: AtomicU64,
    pub provider_fallbacks: AtomicU64,
    pub scorer_fallbacks: AtomicU64,
}

impl OracleStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OracleStatsSnapshot {
        OracleStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            events_seen: self.events_seen.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
            approved: self.approved.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            confirmed: self.confirmed.load(Ordering::Relaxed),
            already_processed: self.already_processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            submission_retries: self.submission_retries.load(Ordering::Relaxed),
            provider_fallbacks: self.provider_fallbacks.load(Ordering::Relaxed),
            scorer_fallbacks: self.scorer_fallbacks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OracleStatsSnapshot {
    pub ticks: u64,
    pub events_seen: u64,
    pub admitted: u64,
    pub duplicates: u64,
    pub source_errors: u64,
    pub approved: u64,
    pub rejected: u64,
    pub confirmed: u64,
    pub already_processed: u64,
    pub failed: u64,
    pub submission_retries: u64,
    pub provider_fallbacks: u64,
    pub scorer_fallbacks: u64,
}

impl OracleStatsSnapshot {
    /// Counters that moved between two snapshots, ignoring the tick counter.
    pub fn has_activity_since(&self, earlier: &OracleStatsSnapshot) -> bool {
        let mut now = self.clone();
        now.ticks = earlier.ticks;
        now != *earlier
    }
}
