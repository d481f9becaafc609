//! Lock-free duration sampling.
//!
//! [`DurationSampler`] is a bucketed histogram with geometric bucket
//! resolution: eleven segments of fixed `(resolution, slots)` pairs cover
//! everything from 1ms up to about 257s, with one overflow slot at the end.
//! `update` is a pair of relaxed atomic increments and is safe under any
//! amount of concurrency; `percentiles` walks the slots and should not race
//! a reset.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// `(resolution, slots)` of one histogram segment.
struct Segment {
    resolution: Duration,
    slots: u32,
}

const fn seg(millis: u64, slots: u32) -> Segment {
    Segment {
        resolution: Duration::from_millis(millis),
        slots,
    }
}

static SEGMENTS: [Segment; 11] = [
    seg(1, 500),    // < 500ms
    seg(2, 250),    // < 1s
    seg(4, 250),    // < 2s
    seg(8, 125),    // < 3s
    seg(16, 125),   // < 5s
    seg(32, 125),   // < 9s
    seg(64, 125),   // < 17s
    seg(128, 125),  // < 33s
    seg(256, 125),  // < 65s
    seg(512, 125),  // < 129s
    seg(1024, 125), // < 257s
];

/// Value reported for percentiles that fall beyond the last segment.
const SATURATED_MS: f64 = 9_999_999.0;

/// Percentile block produced by [`DurationSampler::percentiles`], in
/// milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Percentiles {
    /// 25th percentile.
    pub p25: f64,
    /// Median.
    pub p50: f64,
    /// 75th percentile.
    pub p75: f64,
    /// 95th percentile.
    pub p95: f64,
    /// 98th percentile.
    pub p98: f64,
    /// 99th percentile.
    pub p99: f64,
    /// 99.9th percentile.
    pub p999: f64,
}

const PERCENTILE_POINTS: [f64; 7] = [0.25, 0.5, 0.75, 0.95, 0.98, 0.99, 0.999];

/// Concurrent-update histogram of request durations.
pub struct DurationSampler {
    count: AtomicU64,
    durations: Vec<AtomicU32>,
}

impl DurationSampler {
    /// Create an empty sampler.
    pub fn new() -> Self {
        let mut slots = 1;
        for s in &SEGMENTS {
            slots += s.slots as usize;
        }
        let mut durations = Vec::with_capacity(slots);
        durations.resize_with(slots, || AtomicU32::new(0));
        Self {
            count: AtomicU64::new(0),
            durations,
        }
    }

    /// Record one duration.
    ///
    /// Safe to call concurrently with other `update`s, but not with
    /// [`reset`](Self::reset); a concurrent [`percentiles`](Self::percentiles)
    /// sees an approximate snapshot.
    pub fn update(&self, d: Duration) {
        let mut d = d;
        let mut idx = 0usize;
        for s in &SEGMENTS {
            let bound = s.resolution * s.slots;
            if d < bound - s.resolution / 2 {
                idx += ((d + s.resolution / 2).as_nanos() / s.resolution.as_nanos()) as usize;
                break;
            }
            // A duration in the half-resolution band below the bound rounds
            // into the next segment's first slot.
            d = d.saturating_sub(bound);
            idx += s.slots as usize;
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.durations[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every slot. Callers must hold off concurrent `update`s.
    pub fn reset(&self) {
        for slot in &self.durations {
            slot.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
    }

    /// Total number of recorded durations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Compute P25/P50/P75/P95/P98/P99/P999 from the current slots.
    ///
    /// Percentiles that land past the segment table saturate to
    /// 9,999,999 ms. An empty sampler reports every percentile saturated.
    pub fn percentiles(&self) -> Percentiles {
        let mut result = [SATURATED_MS; PERCENTILE_POINTS.len()];
        let total = self.count.load(Ordering::Relaxed) as f64;

        if total > 0.0 {
            let mut count: u64 = 0;
            let mut di = 0usize;
            let mut pi = 0usize;
            let mut base = Duration::ZERO;

            'walk: for s in &SEGMENTS {
                for i in 0..s.slots {
                    count += u64::from(self.durations[di].load(Ordering::Relaxed));
                    di += 1;
                    let p = count as f64 / total;
                    while p >= PERCENTILE_POINTS[pi] {
                        let d = base + s.resolution * i;
                        result[pi] = d.as_millis() as f64;
                        pi += 1;
                        if pi == PERCENTILE_POINTS.len() {
                            break 'walk;
                        }
                    }
                }
                base += s.resolution * s.slots;
            }
        }

        Percentiles {
            p25: result[0],
            p50: result[1],
            p75: result[2],
            p95: result[3],
            p98: result[4],
            p99: result[5],
            p999: result[6],
        }
    }
}

impl Default for DurationSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn empty_sampler_saturates() {
        let s = DurationSampler::new();
        let p = s.percentiles();
        assert_eq!(p.p25, SATURATED_MS);
        assert_eq!(p.p999, SATURATED_MS);
    }

    #[test]
    fn uniform_population_percentiles() {
        let s = DurationSampler::new();
        // 1..=100 ms, uniformly: p50 should land near 50ms, p99 near 99ms.
        for ms in 1..=100u64 {
            s.update(Duration::from_millis(ms));
        }
        let p = s.percentiles();
        assert!((p.p50 - 50.0).abs() <= 1.0, "p50 = {}", p.p50);
        assert!((p.p99 - 99.0).abs() <= 1.0, "p99 = {}", p.p99);
        assert!(p.p25 <= p.p50 && p.p50 <= p.p75 && p.p75 <= p.p99);
    }

    #[test]
    fn coarse_segment_within_one_resolution() {
        let s = DurationSampler::new();
        // 600ms sits in the second segment (2ms resolution).
        for _ in 0..1000 {
            s.update(Duration::from_millis(600));
        }
        let p = s.percentiles();
        assert!((p.p50 - 600.0).abs() <= 2.0, "p50 = {}", p.p50);
    }

    #[test]
    fn overflow_lands_in_last_slot() {
        let s = DurationSampler::new();
        s.update(Duration::from_secs(600));
        assert_eq!(s.count(), 1);
        // The single huge sample lands in the overflow slot rather than
        // panicking on an out-of-range index; percentiles saturate.
        let p = s.percentiles();
        assert_eq!(p.p50, SATURATED_MS);
    }

    #[test]
    fn reset_zeroes_everything() {
        let s = DurationSampler::new();
        s.update(Duration::from_millis(10));
        s.reset();
        assert_eq!(s.count(), 0);
        assert_eq!(s.percentiles().p50, SATURATED_MS);
    }

    #[test]
    fn concurrent_updates_are_counted() {
        let s = Arc::new(DurationSampler::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = Arc::clone(&s);
            handles.push(std::thread::spawn(move || {
                for ms in 0..500u64 {
                    s.update(Duration::from_millis(ms % 50));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.count(), 8 * 500);
    }
}
