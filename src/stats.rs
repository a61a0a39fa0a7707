//! Per-worker connection and transfer statistics.
//!
//! One registry is shared by every handler thread inside a worker process.
//! Workers do not share registries with each other; each reports its own
//! slice of the traffic.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Capacity of the bandwidth sample ring.
const BANDWIDTH_SAMPLES: usize = 60;

/// Trailing window over which bandwidth is estimated.
const BANDWIDTH_WINDOW: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Counters {
    active_connections: usize,
    total_bytes_sent: u64,
    total_bytes_received: u64,
    samples: VecDeque<(u64, Instant)>,
}

pub struct ProxyStats {
    inner: Mutex<Counters>,
}

/// Point-in-time view for log output and external display.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub active_connections: usize,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub bandwidth: f64,
}

impl ProxyStats {
    pub fn new() -> Self {
        ProxyStats {
            inner: Mutex::new(Counters::default()),
        }
    }

    /// Count a connection for as long as the returned guard lives. The
    /// matching decrement runs on drop, on every exit path.
    pub fn connection_guard(self: &Arc<Self>) -> ConnectionGuard {
        self.inner.lock().active_connections += 1;
        ConnectionGuard {
            stats: Arc::clone(self),
        }
    }

    /// Add to the cumulative totals and push one bandwidth sample.
    pub fn record_bytes(&self, sent: u64, received: u64) {
        self.push_sample(sent, received, Instant::now());
    }

    fn push_sample(&self, sent: u64, received: u64, at: Instant) {
        let mut inner = self.inner.lock();
        inner.total_bytes_sent += sent;
        inner.total_bytes_received += received;
        if inner.samples.len() == BANDWIDTH_SAMPLES {
            inner.samples.pop_front();
        }
        inner.samples.push_back((sent + received, at));
    }

    /// Average bytes/sec over the trailing window; 0 with no recent samples.
    pub fn bandwidth(&self) -> f64 {
        self.bandwidth_at(Instant::now())
    }

    fn bandwidth_at(&self, now: Instant) -> f64 {
        let inner = self.inner.lock();
        let recent: u64 = inner
            .samples
            .iter()
            .filter(|(_, at)| now.duration_since(*at) < BANDWIDTH_WINDOW)
            .map(|(bytes, _)| bytes)
            .sum();
        if recent == 0 {
            return 0.0;
        }
        recent as f64 / BANDWIDTH_WINDOW.as_secs_f64()
    }

    pub fn active_connections(&self) -> usize {
        self.inner.lock().active_connections
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let bandwidth = self.bandwidth();
        let inner = self.inner.lock();
        StatsSnapshot {
            active_connections: inner.active_connections,
            total_bytes_sent: inner.total_bytes_sent,
            total_bytes_received: inner.total_bytes_received,
            bandwidth,
        }
    }

    fn connection_ended(&self) {
        self.inner.lock().active_connections -= 1;
    }
}

pub struct ConnectionGuard {
    stats: Arc<ProxyStats>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.connection_ended();
    }
}

/// Format a byte count for log output.
pub fn format_bytes(mut bytes: f64) -> String {
    for unit in ["B", "KB", "MB", "GB"] {
        if bytes < 1024.0 {
            return format!("{bytes:.1} {unit}");
        }
        bytes /= 1024.0;
    }
    format!("{bytes:.1} TB")
}
