//! Metrics collection for chunked reads
//!
//! Thread-safe counters shared by every session that opts in. Sessions record
//! into the same collector through an `Arc`; there is no global instance.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics collector for chunked range readers
#[derive(Debug, Default)]
pub struct ReaderMetrics {
    // Session lifecycle
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,

    // Chunk fetches
    chunks_fetched: AtomicU64,
    fetch_retries: AtomicU64,
    fetch_failures: AtomicU64,
    total_fetch_duration_us: AtomicU64,

    // Bytes
    bytes_fetched: AtomicU64,
    bytes_delivered: AtomicU64,

    integrity_failures: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub chunks_fetched: u64,
    pub fetch_retries: u64,
    pub fetch_failures: u64,
    pub total_fetch_duration_us: u64,
    pub bytes_fetched: u64,
    pub bytes_delivered: u64,
    pub integrity_failures: u64,
}

impl ReaderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one successfully fetched chunk
    ///
    /// # Arguments
    /// * `bytes` - Size of the fetched chunk payload
    /// * `duration` - Time spent fetching, retries included
    pub fn record_chunk_fetched(&self, bytes: u64, duration: Duration) {
        self.chunks_fetched.fetch_add(1, Ordering::Relaxed);
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
        self.total_fetch_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_fetch_retry(&self) {
        self.fetch_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a chunk fetch that gave up
    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_delivered(&self, bytes: u64) {
        self.bytes_delivered.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_integrity_failure(&self) {
        self.integrity_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    ///
    /// Fields are loaded independently, so a snapshot taken while sessions are
    /// running may not be perfectly consistent across fields.
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            chunks_fetched: self.chunks_fetched.load(Ordering::Relaxed),
            fetch_retries: self.fetch_retries.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            total_fetch_duration_us: self.total_fetch_duration_us.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        self.sessions_opened.store(0, Ordering::Relaxed);
        self.sessions_closed.store(0, Ordering::Relaxed);
        self.chunks_fetched.store(0, Ordering::Relaxed);
        self.fetch_retries.store(0, Ordering::Relaxed);
        self.fetch_failures.store(0, Ordering::Relaxed);
        self.total_fetch_duration_us.store(0, Ordering::Relaxed);
        self.bytes_fetched.store(0, Ordering::Relaxed);
        self.bytes_delivered.store(0, Ordering::Relaxed);
        self.integrity_failures.store(0, Ordering::Relaxed);
    }
}

impl MetricsSnapshot {
    /// Sessions opened but not yet closed
    pub fn active_sessions(&self) -> u64 {
        self.sessions_opened.saturating_sub(self.sessions_closed)
    }

    /// Average time to fetch one chunk in milliseconds
    pub fn avg_fetch_duration_ms(&self) -> f64 {
        if self.chunks_fetched == 0 {
            0.0
        } else {
            (self.total_fetch_duration_us as f64 / self.chunks_fetched as f64) / 1000.0
        }
    }

    /// Render the snapshot in the Prometheus text exposition format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let counters = [
            ("chunked_sessions_opened_total", "Total number of reader sessions opened", self.sessions_opened),
            ("chunked_sessions_closed_total", "Total number of reader sessions closed", self.sessions_closed),
            ("chunked_chunks_fetched_total", "Total number of physical chunks fetched", self.chunks_fetched),
            ("chunked_fetch_retries_total", "Total number of chunk fetch retries", self.fetch_retries),
            ("chunked_fetch_failures_total", "Total number of chunk fetches that gave up", self.fetch_failures),
            ("chunked_bytes_fetched_total", "Total bytes fetched from the backend", self.bytes_fetched),
            ("chunked_bytes_delivered_total", "Total bytes delivered to callers", self.bytes_delivered),
            ("chunked_integrity_failures_total", "Total number of failed integrity checks", self.integrity_failures),
        ];

        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {} {}", name, help);
            let _ = writeln!(output, "# TYPE {} counter", name);
            let _ = writeln!(output, "{} {}", name, value);
            output.push('\n');
        }

        let _ = writeln!(output, "# HELP chunked_active_sessions Reader sessions currently open");
        let _ = writeln!(output, "# TYPE chunked_active_sessions gauge");
        let _ = writeln!(output, "chunked_active_sessions {}", self.active_sessions());
        output.push('\n');

        let _ = writeln!(output, "# HELP chunked_fetch_duration_ms_avg Average chunk fetch duration in milliseconds");
        let _ = writeln!(output, "# TYPE chunked_fetch_duration_ms_avg gauge");
        let _ = writeln!(output, "chunked_fetch_duration_ms_avg {:.3}", self.avg_fetch_duration_ms());

        output
    }
}
