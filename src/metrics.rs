//! Job counters and latency tracking

use crate::message::JobKind;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-process job metrics
#[derive(Default)]
pub struct Metrics {
    pub total_jobs: AtomicU64,
    pub successful_jobs: AtomicU64,
    pub failed_jobs: AtomicU64,
    pub total_latency_ms: AtomicU64,

    pub parse_count: AtomicU64,
    pub thumbnail_count: AtomicU64,
    pub thumbnail_files_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_job(&self, kind: JobKind, success: bool, latency_ms: u64) {
        self.total_jobs.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_jobs.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_jobs.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);

        match kind {
            JobKind::Parse => self.parse_count.fetch_add(1, Ordering::Relaxed),
            JobKind::Thumbnail => self.thumbnail_count.fetch_add(1, Ordering::Relaxed),
            JobKind::ThumbnailToFiles => {
                self.thumbnail_files_count.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_jobs.load(Ordering::Relaxed);
        let failed = self.failed_jobs.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            total_jobs: total,
            successful_jobs: self.successful_jobs.load(Ordering::Relaxed),
            failed_jobs: failed,
            avg_latency_ms: if total > 0 { total_latency / total } else { 0 },
            parse: self.parse_count.load(Ordering::Relaxed),
            thumbnail: self.thumbnail_count.load(Ordering::Relaxed),
            thumbnail_to_files: self.thumbnail_files_count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_jobs: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub avg_latency_ms: u64,
    pub parse: u64,
    pub thumbnail: u64,
    pub thumbnail_to_files: u64,
}
