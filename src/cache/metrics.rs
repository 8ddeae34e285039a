//! Cache Metrics Collection
//!
//! Operation counters for monitoring cache health.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    puts: AtomicU64,
    put_rejections: AtomicU64,

    memory_pops: AtomicU64,
    disk_pops: AtomicU64,
    pop_misses: AtomicU64,

    evictions: AtomicU64,
    eviction_writes: AtomicU64,
    eviction_losses: AtomicU64,
    superseded_writes: AtomicU64,

    async_pops: AtomicU64,
    clears: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put_rejection(&self) {
        self.put_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_pop(&self) {
        self.memory_pops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_pop(&self) {
        self.disk_pops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pop_miss(&self) {
        self.pop_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction_write(&self) {
        self.eviction_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction_loss(&self) {
        self.eviction_losses.fetch_add(1, Ordering::Relaxed);
    }

    /// Eviction write skipped because the key was popped or cleared first
    pub fn record_superseded_write(&self) {
        self.superseded_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_async_pop(&self) {
        self.async_pops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clear(&self) {
        self.clears.fetch_add(1, Ordering::Relaxed);
    }

    /// Pop hit ratio across both tiers
    pub fn pop_hit_ratio(&self) -> f64 {
        let hits = (self.memory_pops.load(Ordering::Relaxed)
            + self.disk_pops.load(Ordering::Relaxed)) as f64;
        let total = hits + self.pop_misses.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Take a point-in-time snapshot with the current tier occupancy
    pub fn snapshot(&self, usage: TierUsage) -> MetricsSnapshot {
        MetricsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            put_rejections: self.put_rejections.load(Ordering::Relaxed),
            memory_pops: self.memory_pops.load(Ordering::Relaxed),
            disk_pops: self.disk_pops.load(Ordering::Relaxed),
            pop_misses: self.pop_misses.load(Ordering::Relaxed),
            pop_hit_ratio: self.pop_hit_ratio(),
            evictions: self.evictions.load(Ordering::Relaxed),
            eviction_writes: self.eviction_writes.load(Ordering::Relaxed),
            eviction_losses: self.eviction_losses.load(Ordering::Relaxed),
            superseded_writes: self.superseded_writes.load(Ordering::Relaxed),
            async_pops: self.async_pops.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
            memory_usage_bytes: usage.memory_bytes,
            memory_capacity_bytes: usage.memory_capacity,
            memory_entries: usage.memory_entries,
            disk_usage_bytes: usage.disk_bytes,
            disk_capacity_bytes: usage.disk_capacity,
            disk_entries: usage.disk_entries,
            queued_jobs: usage.queued_jobs,
        }
    }
}

/// Tier occupancy sampled under the coordinator lock
#[derive(Debug, Clone, Copy, Default)]
pub struct TierUsage {
    pub memory_bytes: u64,
    pub memory_capacity: u64,
    pub memory_entries: usize,
    pub disk_bytes: u64,
    pub disk_capacity: u64,
    /// Indexed keys, persisted or lost
    pub disk_entries: usize,
    /// Worker pool jobs queued or running
    pub queued_jobs: usize,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub puts: u64,
    pub put_rejections: u64,
    pub memory_pops: u64,
    pub disk_pops: u64,
    pub pop_misses: u64,
    /// Hit ratio (0.0 - 1.0)
    pub pop_hit_ratio: f64,
    pub evictions: u64,
    /// Eviction writes that reached disk
    pub eviction_writes: u64,
    /// Eviction writes that failed (tickets now `Lost`)
    pub eviction_losses: u64,
    pub superseded_writes: u64,
    pub async_pops: u64,
    pub clears: u64,
    pub memory_usage_bytes: u64,
    pub memory_capacity_bytes: u64,
    pub memory_entries: usize,
    pub disk_usage_bytes: u64,
    pub disk_capacity_bytes: u64,
    pub disk_entries: usize,
    pub queued_jobs: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_default_zero() {
        let metrics = CacheMetrics::new();
        let snapshot = metrics.snapshot(TierUsage::default());
        assert_eq!(snapshot.puts, 0);
        assert_eq!(snapshot.pop_hit_ratio, 0.0);
    }

    #[test]
    fn test_pop_hit_ratio() {
        let metrics = CacheMetrics::new();
        metrics.record_memory_pop();
        metrics.record_disk_pop();
        metrics.record_pop_miss();
        metrics.record_pop_miss();

        assert_eq!(metrics.pop_hit_ratio(), 0.5);
    }

    #[test]
    fn test_snapshot_carries_usage() {
        let metrics = CacheMetrics::new();
        metrics.record_put();
        metrics.record_eviction();
        metrics.record_eviction_loss();

        let snapshot = metrics.snapshot(TierUsage {
            memory_bytes: 128,
            memory_capacity: 1024,
            memory_entries: 2,
            disk_bytes: 4096,
            disk_capacity: 1 << 20,
            disk_entries: 3,
            queued_jobs: 0,
        });
        assert_eq!(snapshot.puts, 1);
        assert_eq!(snapshot.evictions, 1);
        assert_eq!(snapshot.eviction_losses, 1);
        assert_eq!(snapshot.memory_usage_bytes, 128);
        assert_eq!(snapshot.disk_usage_bytes, 4096);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["disk_usage_bytes"], 4096);
        assert_eq!(json["disk_entries"], 3);
    }
}
