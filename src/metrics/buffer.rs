use std::collections::VecDeque;
use std::time::SystemTime;

use dashmap::DashMap;

use crate::error::IngestError;

use super::sample::{MetricSample, SeriesKey};

/// Fixed-capacity, append-only ring store of metric samples keyed by
/// (component, metric).
///
/// Uses `DashMap` for concurrent map access; each series is independently
/// lockable, so concurrent producers on different series never contend.
/// Readers take a copied snapshot and never hold a series lock across
/// iteration.
pub struct SampleBuffer {
    capacity: usize,
    series: DashMap<SeriesKey, VecDeque<MetricSample>>,
}

impl SampleBuffer {
    /// Creates a buffer whose per-series rings hold at most `capacity`
    /// samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            series: DashMap::new(),
        }
    }

    /// Appends a sample to its series ring.
    ///
    /// On overflow the oldest sample is evicted (FIFO). Returns `true` when
    /// an eviction happened so the caller can account the data loss.
    pub fn record(&self, sample: MetricSample) -> Result<bool, IngestError> {
        sample.validate()?;

        let key = sample.key();
        let mut ring = self
            .series
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(1024)));

        let evicted = if ring.len() >= self.capacity {
            ring.pop_front();
            true
        } else {
            false
        };
        ring.push_back(sample);

        Ok(evicted)
    }

    /// Returns a copy of the samples for `key` with wall time >= `since`,
    /// in arrival order.
    ///
    /// The copy is safe to iterate independently of concurrent writes.
    pub fn snapshot(&self, key: &SeriesKey, since: SystemTime) -> Vec<MetricSample> {
        match self.series.get(key) {
            Some(ring) => ring
                .iter()
                .filter(|s| s.wall_time >= since)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// All series keys currently stored, sorted for deterministic iteration.
    pub fn keys(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self.series.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of samples currently held for `key`.
    pub fn len(&self, key: &SeriesKey) -> usize {
        self.series.get(key).map_or(0, |ring| ring.len())
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Drops all stored samples.
    pub fn clear(&self) {
        self.series.clear();
    }
}
