use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use super::buffer::SampleBuffer;
use super::sample::{SeriesKey, Unit};

/// Rolling statistics over one trailing window of a series.
///
/// Derived, recomputed on demand; never mutated after construction. Carries
/// copies of everything the analysis rules need (latest value, recorded
/// threshold, unit) so it has no back-reference into the buffer.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub key: SeriesKey,
    #[serde(with = "crate::snapshot::timefmt")]
    pub window_start: SystemTime,
    #[serde(with = "crate::snapshot::timefmt")]
    pub window_end: SystemTime,
    pub count: u64,
    pub mean: f64,
    pub p95: f64,
    pub min: f64,
    pub max: f64,
    /// Linear-regression coefficient of value vs. time, in value-units per
    /// second. Zero when fewer than two samples fall in the window.
    pub slope: f64,
    pub latest: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
}

impl WindowStats {
    /// Zero-value marker for a window containing no samples.
    pub fn empty(key: SeriesKey, window_start: SystemTime, window_end: SystemTime) -> Self {
        Self {
            key,
            window_start,
            window_end,
            count: 0,
            mean: 0.0,
            p95: 0.0,
            min: 0.0,
            max: 0.0,
            slope: 0.0,
            latest: 0.0,
            threshold: None,
            unit: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[derive(Clone)]
struct CachedStats {
    tick: u64,
    stats: WindowStats,
}

/// Computes rolling window statistics over [`SampleBuffer`] snapshots.
///
/// Results are cached per (series, window) and invalidated whenever the
/// wall clock advances past a one-second coarse tick, so multiple window
/// durations per key and repeated reads within a tick do not recompute.
pub struct WindowAggregator {
    buffer: Arc<SampleBuffer>,
    cache: Mutex<HashMap<(SeriesKey, u64), CachedStats>>,
}

impl WindowAggregator {
    pub fn new(buffer: Arc<SampleBuffer>) -> Self {
        Self {
            buffer,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Computes statistics for `key` over the trailing `window` ending at
    /// `now`. Returns the empty marker when no samples fall in the window —
    /// never an error.
    pub fn compute(&self, key: &SeriesKey, window: Duration, now: SystemTime) -> WindowStats {
        let tick = coarse_tick(now);
        let cache_key = (key.clone(), window.as_millis() as u64);

        if let Ok(cache) = self.cache.lock() {
            if let Some(cached) = cache.get(&cache_key) {
                if cached.tick == tick {
                    return cached.stats.clone();
                }
            }
        }

        let stats = self.compute_uncached(key, window, now);

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                cache_key,
                CachedStats {
                    tick,
                    stats: stats.clone(),
                },
            );
        }

        stats
    }

    fn compute_uncached(&self, key: &SeriesKey, window: Duration, now: SystemTime) -> WindowStats {
        let window_start = now.checked_sub(window).unwrap_or(UNIX_EPOCH);
        let samples = self.buffer.snapshot(key, window_start);

        if samples.is_empty() {
            return WindowStats::empty(key.clone(), window_start, now);
        }

        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut values = Vec::with_capacity(samples.len());

        for s in &samples {
            sum += s.value;
            min = min.min(s.value);
            max = max.max(s.value);
            values.push(s.value);
        }

        let count = samples.len();
        let mean = sum / count as f64;

        // Partial sort on the bounded window is acceptable given the ring
        // capacity bound.
        let p95_idx = ((count as f64 * 0.95).ceil() as usize).clamp(1, count) - 1;
        values.select_nth_unstable_by(p95_idx, |a, b| a.total_cmp(b));
        let p95 = values[p95_idx];

        let latest = samples[count - 1].value;
        let threshold = samples.iter().rev().find_map(|s| s.threshold);
        let unit = samples.last().map(|s| s.unit);

        WindowStats {
            key: key.clone(),
            window_start,
            window_end: now,
            count: count as u64,
            mean,
            p95,
            min,
            max,
            slope: regression_slope(&samples, window_start, mean),
            latest,
            threshold,
            unit,
        }
    }
}

/// One-second coarse tick used for cache staleness bounding.
fn coarse_tick(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Least-squares slope of value vs. elapsed seconds since `window_start`.
fn regression_slope(
    samples: &[super::sample::MetricSample],
    window_start: SystemTime,
    mean_value: f64,
) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }

    let times: Vec<f64> = samples
        .iter()
        .map(|s| {
            s.wall_time
                .duration_since(window_start)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0)
        })
        .collect();

    let mean_t = times.iter().sum::<f64>() / times.len() as f64;

    let mut numer = 0.0;
    let mut denom = 0.0;
    for (t, s) in times.iter().zip(samples.iter()) {
        let dt = t - mean_t;
        numer += dt * (s.value - mean_value);
        denom += dt * dt;
    }

    if denom == 0.0 {
        0.0
    } else {
        numer / denom
    }
}
