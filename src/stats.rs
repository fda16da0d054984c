use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for one cache engine instance. Purely observational.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Total data/metadata requests received
    pub requests: Arc<AtomicU64>,
    /// Requests served entirely from the local cache
    pub cache_hits: Arc<AtomicU64>,
    /// Requests that needed an origin fetch
    pub cache_misses: Arc<AtomicU64>,
    /// Bytes delivered to callers
    pub bytes_served: Arc<AtomicU64>,
    /// Bytes fetched from the origin
    pub bytes_fetched: Arc<AtomicU64>,
    /// Requests cancelled by the caller
    pub cancellations: Arc<AtomicU64>,
    /// Start time for calculating uptime
    pub start_time: Instant,
}

impl CacheStats {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(AtomicU64::new(0)),
            cache_hits: Arc::new(AtomicU64::new(0)),
            cache_misses: Arc::new(AtomicU64::new(0)),
            bytes_served: Arc::new(AtomicU64::new(0)),
            bytes_fetched: Arc::new(AtomicU64::new(0)),
            cancellations: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn increment_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_served(&self, bytes: u64) {
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_fetched(&self, bytes: u64) {
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn format_report(&self) -> String {
        let uptime_secs = self.start_time.elapsed().as_secs();
        let hours = uptime_secs / 3600;
        let minutes = (uptime_secs % 3600) / 60;
        let seconds = uptime_secs % 60;

        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        let served_mb = self.bytes_served.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0);
        let fetched_mb = self.bytes_fetched.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0);

        format!(
            "📊 Cache Stats [{}h {}m {}s] | Requests: {} | Hit Rate: {:.1}% | Served: {:.1} MB | Fetched: {:.1} MB | Cancelled: {}",
            hours,
            minutes,
            seconds,
            self.requests.load(Ordering::Relaxed),
            hit_rate,
            served_mb,
            fetched_mb,
            self.cancellations.load(Ordering::Relaxed)
        )
    }
}

impl Default for CacheStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Reports download progress only when the integer percentage changes, so
/// per-chunk index updates do not flood the log.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last_percent: Option<u32>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Some(percent)` when the integer percentage moved forward.
    ///
    /// Never moves backwards over the life of one resource.
    pub fn update(&mut self, percent: u32) -> Option<u32> {
        match self.last_percent {
            Some(last) if percent <= last => None,
            _ => {
                self.last_percent = Some(percent);
                Some(percent)
            }
        }
    }
}
