//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps the interval counters to get a
/// consistent snapshot; the cumulative counters and gauges are only ever
/// loaded, so the Prometheus endpoint can read them without side effects.
pub struct Metrics {
    /// Total samples ever evaluated (monotonic)
    samples_total: AtomicU64,
    /// Samples since last report (reset on report)
    samples_since_report: AtomicU64,
    /// Sum of processing latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max processing latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Processing latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Processing latency histogram buckets (cumulative, for Prometheus)
    latency_cum_buckets: [AtomicU64; NUM_BUCKETS],
    /// Cumulative sum of processing latencies (for Prometheus)
    latency_cum_sum_us: AtomicU64,
    /// Samples snapped to 0.0 by the noise floor (monotonic)
    samples_clamped_total: AtomicU64,
    /// Samples dropped because the channel was full (monotonic)
    samples_dropped_total: AtomicU64,
    /// Sentences rejected by checksum or parse (monotonic)
    invalid_sentences_total: AtomicU64,
    /// Overspeed flag flips to true (monotonic)
    overspeed_transitions_total: AtomicU64,
    /// Limit selections applied (monotonic)
    limit_changes_total: AtomicU64,
    /// Current speed gauge, km/h fixed-point x100
    speed_kmh_x100: AtomicU64,
    /// Selected limit gauge, km/h fixed-point x100
    limit_kmh_x100: AtomicU64,
    /// Current overspeed flag (0/1)
    speeding: AtomicU64,
    /// Permission status code (see PermissionStatus::code)
    permission_state: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_total: AtomicU64::new(0),
            samples_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_cum_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_cum_sum_us: AtomicU64::new(0),
            samples_clamped_total: AtomicU64::new(0),
            samples_dropped_total: AtomicU64::new(0),
            invalid_sentences_total: AtomicU64::new(0),
            overspeed_transitions_total: AtomicU64::new(0),
            limit_changes_total: AtomicU64::new(0),
            speed_kmh_x100: AtomicU64::new(0),
            limit_kmh_x100: AtomicU64::new(0),
            speeding: AtomicU64::new(0),
            permission_state: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record an evaluated sample with its processing latency (lock-free)
    #[inline]
    pub fn record_sample(&self, latency_us: u64) {
        self.samples_total.fetch_add(1, Ordering::Relaxed);
        self.samples_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_cum_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        // Update histogram buckets
        let bucket = bucket_index(latency_us);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.latency_cum_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        // Update max
        update_atomic_max(&self.latency_max_us, latency_us);
    }

    /// Record a sample snapped to standstill by the noise floor (lock-free)
    #[inline]
    pub fn record_sample_clamped(&self) {
        self.samples_clamped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sample dropped due to channel full (lock-free)
    #[inline]
    pub fn record_sample_dropped(&self) {
        self.samples_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sentence rejected by checksum or field parse (lock-free)
    #[inline]
    pub fn record_invalid_sentence(&self) {
        self.invalid_sentences_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the overspeed flag flipping to true (lock-free)
    #[inline]
    pub fn record_overspeed_transition(&self) {
        self.overspeed_transitions_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an applied limit selection (lock-free)
    #[inline]
    pub fn record_limit_change(&self) {
        self.limit_changes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the current speed gauge (km/h)
    #[inline]
    pub fn set_speed_kmh(&self, kmh: f64) {
        self.speed_kmh_x100.store((kmh * 100.0).round() as u64, Ordering::Relaxed);
    }

    /// Set the current overspeed flag gauge
    #[inline]
    pub fn set_speeding(&self, speeding: bool) {
        self.speeding.store(u64::from(speeding), Ordering::Relaxed);
    }

    /// Set the selected limit gauge (km/h)
    #[inline]
    pub fn set_limit_kmh(&self, kmh: f64) {
        self.limit_kmh_x100.store((kmh * 100.0).round() as u64, Ordering::Relaxed);
    }

    /// Set the permission status gauge
    #[inline]
    pub fn set_permission_state(&self, code: u64) {
        self.permission_state.store(code, Ordering::Relaxed);
    }

    /// Get total samples evaluated
    #[inline]
    pub fn samples_total(&self) -> u64 {
        self.samples_total.load(Ordering::Relaxed)
    }

    /// Get total clamped samples
    #[inline]
    pub fn samples_clamped_total(&self) -> u64 {
        self.samples_clamped_total.load(Ordering::Relaxed)
    }

    /// Get total dropped samples
    #[inline]
    pub fn samples_dropped_total(&self) -> u64 {
        self.samples_dropped_total.load(Ordering::Relaxed)
    }

    /// Get total rejected sentences
    #[inline]
    pub fn invalid_sentences_total(&self) -> u64 {
        self.invalid_sentences_total.load(Ordering::Relaxed)
    }

    /// Get total overspeed transitions
    #[inline]
    pub fn overspeed_transitions_total(&self) -> u64 {
        self.overspeed_transitions_total.load(Ordering::Relaxed)
    }

    /// Get total limit changes
    #[inline]
    pub fn limit_changes_total(&self) -> u64 {
        self.limit_changes_total.load(Ordering::Relaxed)
    }

    /// Current speed gauge (km/h)
    #[inline]
    pub fn speed_kmh(&self) -> f64 {
        self.speed_kmh_x100.load(Ordering::Relaxed) as f64 / 100.0
    }

    /// Current limit gauge (km/h)
    #[inline]
    pub fn limit_kmh(&self) -> f64 {
        self.limit_kmh_x100.load(Ordering::Relaxed) as f64 / 100.0
    }

    /// Current overspeed flag
    #[inline]
    pub fn speeding(&self) -> bool {
        self.speeding.load(Ordering::Relaxed) != 0
    }

    /// Current permission status code
    #[inline]
    pub fn permission_state(&self) -> u64 {
        self.permission_state.load(Ordering::Relaxed)
    }

    /// Cumulative latency histogram and sum, for the Prometheus endpoint
    pub fn latency_histogram(&self) -> ([u64; NUM_BUCKETS], u64) {
        (load_buckets(&self.latency_cum_buckets), self.latency_cum_sum_us.load(Ordering::Relaxed))
    }

    /// Latency percentile over the cumulative histogram (µs)
    pub fn latency_percentile(&self, percentile: f64) -> u64 {
        let buckets = load_buckets(&self.latency_cum_buckets);
        percentile_from_buckets(&buckets, percentile)
    }

    /// Calculate and return metrics summary, then reset interval counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        // Swap interval counters to zero and get their values
        let samples_count = self.samples_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);

        // Swap histogram buckets and collect values
        let lat_buckets = swap_buckets(&self.latency_buckets);

        // Monotonic counters (don't reset)
        let samples_total = self.samples_total.load(Ordering::Relaxed);

        // Calculate elapsed time and reset
        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let samples_per_sec = if elapsed.as_secs_f64() > 0.0 {
            samples_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let avg_latency = if samples_count > 0 { latency_sum / samples_count } else { 0 };

        let lat_p50 = percentile_from_buckets(&lat_buckets, 0.50);
        let lat_p95 = percentile_from_buckets(&lat_buckets, 0.95);
        let lat_p99 = percentile_from_buckets(&lat_buckets, 0.99);

        MetricsSummary {
            samples_total,
            samples_per_sec,
            avg_latency_us: avg_latency,
            max_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: lat_p50,
            lat_p95_us: lat_p95,
            lat_p99_us: lat_p99,
            speed_kmh: self.speed_kmh(),
            limit_kmh: self.limit_kmh(),
            speeding: self.speeding(),
            permission_state: self.permission_state(),
            samples_clamped_total: self.samples_clamped_total(),
            samples_dropped_total: self.samples_dropped_total(),
            invalid_sentences_total: self.invalid_sentences_total(),
            overspeed_transitions_total: self.overspeed_transitions_total(),
            limit_changes_total: self.limit_changes_total(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for the Prometheus endpoint)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub samples_total: u64,
    pub samples_per_sec: f64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    /// Processing latency histogram buckets for the last interval
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    /// 50th percentile latency (µs)
    pub lat_p50_us: u64,
    /// 95th percentile latency (µs)
    pub lat_p95_us: u64,
    /// 99th percentile latency (µs)
    pub lat_p99_us: u64,
    /// Current speed gauge (km/h)
    pub speed_kmh: f64,
    /// Selected limit gauge (km/h)
    pub limit_kmh: f64,
    /// Current overspeed flag
    pub speeding: bool,
    /// Permission status code
    pub permission_state: u64,
    pub samples_clamped_total: u64,
    pub samples_dropped_total: u64,
    pub invalid_sentences_total: u64,
    pub overspeed_transitions_total: u64,
    pub limit_changes_total: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            samples_total = %self.samples_total,
            samples_per_sec = format!("{:.1}", self.samples_per_sec),
            avg_latency_us = %self.avg_latency_us,
            max_latency_us = %self.max_latency_us,
            p50_us = %self.lat_p50_us,
            p95_us = %self.lat_p95_us,
            p99_us = %self.lat_p99_us,
            speed_kmh = format!("{:.1}", self.speed_kmh),
            limit_kmh = format!("{:.0}", self.limit_kmh),
            speeding = %self.speeding,
            clamped = %self.samples_clamped_total,
            dropped = %self.samples_dropped_total,
            invalid = %self.invalid_sentences_total,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.samples_total(), 0);
        assert_eq!(metrics.samples_clamped_total(), 0);
        assert_eq!(metrics.permission_state(), 0);
    }

    #[test]
    fn test_record_sample() {
        let metrics = Metrics::new();

        metrics.record_sample(100);
        assert_eq!(metrics.samples_total(), 1);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 100);

        metrics.record_sample(200);
        assert_eq!(metrics.samples_total(), 2);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 300);
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();

        metrics.record_sample(100);
        metrics.record_sample(200);
        metrics.record_sample(300);
        metrics.record_limit_change();

        let summary = metrics.report();

        assert_eq!(summary.samples_total, 3);
        assert_eq!(summary.avg_latency_us, 200); // (100+200+300)/3
        assert_eq!(summary.max_latency_us, 300);
        assert_eq!(summary.limit_changes_total, 1);

        // Interval counters should be reset
        assert_eq!(metrics.samples_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency_max_us.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_report_empty() {
        let metrics = Metrics::new();
        let summary = metrics.report();

        assert_eq!(summary.samples_total, 0);
        assert_eq!(summary.avg_latency_us, 0);
        assert_eq!(summary.max_latency_us, 0);
        assert_eq!(summary.lat_p99_us, 0);
    }

    #[test]
    fn test_max_latency_tracking() {
        let metrics = Metrics::new();

        metrics.record_sample(100);
        metrics.record_sample(500);
        metrics.record_sample(200);
        metrics.record_sample(50);

        assert_eq!(metrics.latency_max_us.load(Ordering::Relaxed), 500);
    }

    #[test]
    fn test_cumulative_histogram_survives_report() {
        let metrics = Metrics::new();

        metrics.record_sample(150);
        metrics.record_sample(250);
        let _ = metrics.report();

        // Interval buckets were swapped to zero, cumulative ones were not
        let (buckets, sum) = metrics.latency_histogram();
        assert_eq!(buckets[1], 1); // 150µs in ≤200
        assert_eq!(buckets[2], 1); // 250µs in ≤400
        assert_eq!(sum, 400);
    }

    #[test]
    fn test_gauges() {
        let metrics = Metrics::new();

        metrics.set_speed_kmh(50.04);
        metrics.set_limit_kmh(50.0);
        metrics.set_speeding(true);
        metrics.set_permission_state(4);

        assert!((metrics.speed_kmh() - 50.04).abs() < 0.01);
        assert_eq!(metrics.limit_kmh(), 50.0);
        assert!(metrics.speeding());
        assert_eq!(metrics.permission_state(), 4);

        metrics.set_speeding(false);
        assert!(!metrics.speeding());
    }

    #[test]
    fn test_event_counters() {
        let metrics = Metrics::new();

        metrics.record_sample_clamped();
        metrics.record_sample_clamped();
        metrics.record_sample_dropped();
        metrics.record_invalid_sentence();
        metrics.record_overspeed_transition();

        assert_eq!(metrics.samples_clamped_total(), 2);
        assert_eq!(metrics.samples_dropped_total(), 1);
        assert_eq!(metrics.invalid_sentences_total(), 1);
        assert_eq!(metrics.overspeed_transitions_total(), 1);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        // Spawn 10 threads, each recording 1000 samples
        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_sample(i as u64);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.samples_total(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        // Test bucket boundaries
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(200), 1);
        assert_eq!(bucket_index(201), 2);
        assert_eq!(bucket_index(400), 2);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10); // overflow
        assert_eq!(bucket_index(100000), 10);
    }

    #[test]
    fn test_histogram_buckets() {
        let metrics = Metrics::new();

        // Record samples in different buckets
        metrics.record_sample(50); // bucket 0 (≤100)
        metrics.record_sample(150); // bucket 1 (≤200)
        metrics.record_sample(350); // bucket 2 (≤400)
        metrics.record_sample(60000); // bucket 10 (overflow)

        let summary = metrics.report();

        assert_eq!(summary.lat_buckets[0], 1);
        assert_eq!(summary.lat_buckets[1], 1);
        assert_eq!(summary.lat_buckets[2], 1);
        assert_eq!(summary.lat_buckets[10], 1);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();

        // Record 100 samples, all at 150µs (bucket 1, ≤200)
        for _ in 0..100 {
            metrics.record_sample(150);
        }

        let summary = metrics.report();

        // All percentiles should be 200 (upper bound of bucket 1)
        assert_eq!(summary.lat_p50_us, 200);
        assert_eq!(summary.lat_p95_us, 200);
        assert_eq!(summary.lat_p99_us, 200);
    }
}
