use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Running counters of a receiver
#[derive(Debug, Default)]
pub struct ReceiverStatistics {
    received: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
    retried: AtomicU64,
    errors: AtomicU64,
    processed: AtomicU64,
    total_duration_ms: AtomicU64,
    min_duration_ms: AtomicU64,
    max_duration_ms: AtomicU64,
}

/// Point-in-time copy of [`ReceiverStatistics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub received: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub retried: u64,
    pub errors: u64,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
    pub avg_duration_ms: Option<f64>,
}

impl ReceiverStatistics {
    pub fn new() -> Self {
        Self {
            min_duration_ms: AtomicU64::new(u64::MAX),
            ..Self::default()
        }
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message that went through the pipeline
    pub fn record_processed(&self, duration: Duration, in_error: bool) {
        if in_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        } else {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        }
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_duration_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_duration_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let has_durations = processed > 0;
        StatisticsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            min_duration_ms: has_durations.then(|| self.min_duration_ms.load(Ordering::Relaxed)),
            max_duration_ms: has_durations.then(|| self.max_duration_ms.load(Ordering::Relaxed)),
            avg_duration_ms: has_durations
                .then(|| self.total_duration_ms.load(Ordering::Relaxed) as f64 / processed as f64),
        }
    }
}
