//! Statistics counters
//! Per-connection monotonic counters plus post-verdict global aggregation

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Monotonic byte counters owned by one connection.
///
/// Adds may come from both I/O halves of a connection; reads happen on the
/// driver and at aggregation, so plain relaxed atomics suffice.
pub struct ConnectionStats {
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    start_time: RwLock<Option<Instant>>,
    end_time: RwLock<Option<Instant>>,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            start_time: RwLock::new(None),
            end_time: RwLock::new(None),
        }
    }

    pub fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    pub fn stop(&self) {
        *self.end_time.write() = Some(Instant::now());
    }

    #[inline]
    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_recv(&self, bytes: u64) {
        self.bytes_recv.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_recv(&self) -> u64 {
        self.bytes_recv.load(Ordering::Relaxed)
    }

    /// Elapsed time between start and stop, or since start if still running
    pub fn elapsed(&self) -> Duration {
        let start = match *self.start_time.read() {
            Some(t) => t,
            None => return Duration::ZERO,
        };
        match *self.end_time.read() {
            Some(end) => end.duration_since(start),
            None => start.elapsed(),
        }
    }
}

/// Per-connection counters for the datagram streaming pattern
#[derive(Default)]
pub struct DatagramStats {
    pub bits_received: AtomicU64,
    pub successful_frames: AtomicU64,
    pub dropped_frames: AtomicU64,
    pub duplicate_frames: AtomicU64,
    pub retry_attempts: AtomicU64,
    pub error_frames: AtomicU64,
    /// (sender timestamp ns, receiver timestamp ns) per successful frame
    jitter_samples: RwLock<Vec<(u64, u64)>>,
}

impl DatagramStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_successful(&self, payload_bytes: u64) {
        self.successful_frames.fetch_add(1, Ordering::Relaxed);
        self.bits_received.fetch_add(payload_bytes * 8, Ordering::Relaxed);
    }

    pub fn record_jitter_sample(&self, send_ns: u64, recv_ns: u64) {
        self.jitter_samples.write().push((send_ns, recv_ns));
    }

    /// Mean absolute deviation of consecutive one-way-delay deltas.
    ///
    /// Clock-offset free: the constant offset between the two hosts cancels
    /// in the delta of deltas.
    pub fn mean_jitter(&self) -> Duration {
        let samples = self.jitter_samples.read();
        if samples.len() < 2 {
            return Duration::ZERO;
        }
        let mut total: i128 = 0;
        let mut previous: Option<i128> = None;
        for &(send_ns, recv_ns) in samples.iter() {
            let delay = recv_ns as i128 - send_ns as i128;
            if let Some(prev) = previous {
                total += (delay - prev).abs();
            }
            previous = Some(delay);
        }
        Duration::from_nanos((total / (samples.len() as i128 - 1)) as u64)
    }

    pub fn snapshot(&self) -> DatagramSnapshot {
        DatagramSnapshot {
            bits_received: self.bits_received.load(Ordering::Relaxed),
            successful_frames: self.successful_frames.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            duplicate_frames: self.duplicate_frames.load(Ordering::Relaxed),
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            error_frames: self.error_frames.load(Ordering::Relaxed),
            mean_jitter: self.mean_jitter(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatagramSnapshot {
    pub bits_received: u64,
    pub successful_frames: u64,
    pub dropped_frames: u64,
    pub duplicate_frames: u64,
    pub retry_attempts: u64,
    pub error_frames: u64,
    pub mean_jitter: Duration,
}

/// Run-wide historic statistics, aggregated only after a connection's verdict
#[derive(Default)]
pub struct GlobalStats {
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    connections_completed: AtomicU64,
    connections_failed: AtomicU64,
    start_time: RwLock<Option<Instant>>,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    pub fn aggregate(&self, stats: &ConnectionStats, success: bool) {
        self.bytes_sent.fetch_add(stats.bytes_sent(), Ordering::Relaxed);
        self.bytes_recv.fetch_add(stats.bytes_recv(), Ordering::Relaxed);
        if success {
            self.connections_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.connections_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> GlobalSnapshot {
        let duration = self
            .start_time
            .read()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        let sent = self.bytes_sent.load(Ordering::Relaxed);
        let recv = self.bytes_recv.load(Ordering::Relaxed);
        let secs = duration.as_secs_f64().max(0.001);

        GlobalSnapshot {
            bytes_sent: sent,
            bytes_recv: recv,
            connections_completed: self.connections_completed.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            duration,
            bps: ((sent + recv) as f64 / secs) as u64,
        }
    }

    pub fn failed(&self) -> u64 {
        self.connections_failed.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GlobalSnapshot {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub connections_completed: u64,
    pub connections_failed: u64,
    pub duration: Duration,
    /// Combined bytes/second across both directions
    pub bps: u64,
}

impl GlobalSnapshot {
    pub fn mbps(&self) -> f64 {
        (self.bps as f64 * 8.0) / 1_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_counters_accumulate() {
        let stats = ConnectionStats::new();
        stats.start();
        stats.record_sent(100);
        stats.record_sent(50);
        stats.record_recv(200);
        assert_eq!(stats.bytes_sent(), 150);
        assert_eq!(stats.bytes_recv(), 200);
    }

    #[test]
    fn elapsed_zero_before_start() {
        let stats = ConnectionStats::new();
        assert_eq!(stats.elapsed(), Duration::ZERO);
    }

    #[test]
    fn global_aggregates_after_verdict() {
        let global = GlobalStats::new();
        global.start();

        let conn = ConnectionStats::new();
        conn.record_sent(1024);
        conn.record_recv(4);
        global.aggregate(&conn, true);

        let failed = ConnectionStats::new();
        failed.record_recv(12);
        global.aggregate(&failed, false);

        let snap = global.snapshot();
        assert_eq!(snap.bytes_sent, 1024);
        assert_eq!(snap.bytes_recv, 16);
        assert_eq!(snap.connections_completed, 1);
        assert_eq!(snap.connections_failed, 1);
    }

    #[test]
    fn jitter_ignores_constant_clock_offset() {
        let stats = DatagramStats::new();
        // perfectly even arrival spacing, huge clock offset
        let offset = 1_000_000_000_000u64;
        for i in 0..10u64 {
            stats.record_jitter_sample(i * 33_000_000, offset + i * 33_000_000 + 5_000);
        }
        assert_eq!(stats.mean_jitter(), Duration::ZERO);
    }

    #[test]
    fn jitter_measures_delay_variation() {
        let stats = DatagramStats::new();
        stats.record_jitter_sample(0, 1_000);
        stats.record_jitter_sample(100, 2_100); // delay grew by 1000ns
        let jitter = stats.mean_jitter();
        assert_eq!(jitter, Duration::from_nanos(1000));
    }

    #[test]
    fn datagram_classification_counters() {
        let stats = DatagramStats::new();
        stats.record_successful(4166);
        stats.record_successful(4166);
        stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.successful_frames, 2);
        assert_eq!(snap.dropped_frames, 1);
        assert_eq!(snap.bits_received, 2 * 4166 * 8);
    }
}
