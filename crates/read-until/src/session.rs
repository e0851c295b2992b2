use crate::{BatcherStats, CacheStats};
use portable_atomic::{AtomicF64, AtomicU64, Ordering};

/// Lifecycle of the stream coordinator.
///
/// ```text
/// Idle -> Connecting -> Streaming -> Draining -> Closed
///             ^             |
///             +-------------+  (transport error, reconnect enabled)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Draining,
    Closed,
}

impl StreamState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Counters updated by the inbound loop.
#[derive(Default)]
pub(crate) struct SessionCounters {
    samples_since_start: AtomicU64,
    seconds_since_start: AtomicF64,
    chunks_received: AtomicU64,
    chunks_filtered: AtomicU64,
    reconnects: AtomicU64,
}

impl SessionCounters {
    /// Records the server's acquisition clock. The server never moves it
    /// backwards, but a reconnect may replay an older message, so only forward
    /// progress is kept.
    pub(crate) fn record_progress(&self, samples: u64, seconds: f64) {
        self.samples_since_start.fetch_max(samples, Ordering::Relaxed);
        self.seconds_since_start.fetch_max(seconds, Ordering::Relaxed);
    }

    pub(crate) fn add_chunks(&self, count: u64) {
        self.chunks_received.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_filtered(&self, count: u64) {
        self.chunks_filtered.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(
        &self,
        cache: CacheStats,
        occupancy: usize,
        actions: BatcherStats,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            samples_since_start: self.samples_since_start.load(Ordering::Relaxed),
            seconds_since_start: self.seconds_since_start.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_filtered: self.chunks_filtered.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            cache_occupancy: occupancy,
            cache,
            actions,
        }
    }
}

/// Point-in-time view of session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Latest acquisition clock reported by the server, in samples.
    pub samples_since_start: u64,
    /// Latest acquisition clock reported by the server, in seconds.
    pub seconds_since_start: f64,
    /// Chunks received from the server, before filtering.
    pub chunks_received: u64,
    /// Chunks discarded by the classification prefilter or one-chunk mode.
    pub chunks_filtered: u64,
    pub reconnects: u64,
    /// Occupied cache slots.
    pub cache_occupancy: usize,
    pub cache: CacheStats,
    pub actions: BatcherStats,
}
