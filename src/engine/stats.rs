use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Internal counter kinds reported by the periodic stats log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CounterKind {
    InvalidSample,
    InvalidSpan,
    OrphanSpan,
    EvictedSample,
    SlowConsumerDrop,
    TickOverrun,
    SinkFailure,
    TickCompleted,
}

pub const COUNTER_KIND_CARDINALITY: usize = 8;

impl CounterKind {
    pub const ALL: [CounterKind; COUNTER_KIND_CARDINALITY] = [
        CounterKind::InvalidSample,
        CounterKind::InvalidSpan,
        CounterKind::OrphanSpan,
        CounterKind::EvictedSample,
        CounterKind::SlowConsumerDrop,
        CounterKind::TickOverrun,
        CounterKind::SinkFailure,
        CounterKind::TickCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidSample => "invalid_sample",
            Self::InvalidSpan => "invalid_span",
            Self::OrphanSpan => "orphan_span",
            Self::EvictedSample => "evicted_sample",
            Self::SlowConsumerDrop => "slow_consumer_drop",
            Self::TickOverrun => "tick_overrun",
            Self::SinkFailure => "sink_failure",
            Self::TickCompleted => "tick_completed",
        }
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free per-kind counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct EngineStats {
    counts: [AtomicU64; COUNTER_KIND_CARDINALITY],
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment the counter for the given kind by one.
    pub fn record(&self, kind: CounterKind) {
        self.counts[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter for the given kind by n.
    pub fn record_n(&self, kind: CounterKind, n: u64) {
        self.counts[kind as usize].fetch_add(n, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters, returning only non-zero
    /// entries.
    pub fn snapshot(&self) -> Vec<(CounterKind, u64)> {
        let mut result = Vec::new();

        for kind in CounterKind::ALL {
            let v = self.counts[kind as usize].swap(0, Ordering::Relaxed);
            if v > 0 {
                result.push((kind, v));
            }
        }

        result
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = EngineStats::new();
        stats.record(CounterKind::InvalidSample);
        stats.record(CounterKind::InvalidSample);
        stats.record(CounterKind::TickCompleted);

        let snap = stats.snapshot();
        assert_eq!(snap.len(), 2);

        let invalid = snap
            .iter()
            .find(|(k, _)| *k == CounterKind::InvalidSample)
            .map(|(_, v)| *v);
        assert_eq!(invalid, Some(2));
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = EngineStats::new();
        stats.record(CounterKind::OrphanSpan);

        assert_eq!(stats.snapshot().len(), 1);
        assert!(stats.snapshot().is_empty());
    }

    #[test]
    fn test_record_n() {
        let stats = EngineStats::new();
        stats.record_n(CounterKind::SlowConsumerDrop, 42);

        let snap = stats.snapshot();
        assert_eq!(snap, vec![(CounterKind::SlowConsumerDrop, 42)]);
    }
}
