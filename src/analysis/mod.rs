pub mod recommend;

use std::collections::HashMap;
use std::time::SystemTime;

use serde::Serialize;

use crate::config::{AnalysisConfig, ThresholdSource};
use crate::metrics::sample::{Polarity, SeriesKey};
use crate::metrics::window::WindowStats;

/// Kind of detected anomaly condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    ThresholdBreach,
    TrendDegradation,
    VolumeAnomaly,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThresholdBreach => "threshold_breach",
            Self::TrendDegradation => "trend_degradation",
            Self::VolumeAnomaly => "volume_anomaly",
        }
    }
}

/// Severity of a finding or recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// A currently-open anomaly condition tied to one series.
///
/// Mutated only to extend `last_seen`/`observed_value` while the condition
/// persists; removed once the condition clears for two consecutive
/// evaluations.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub id: u64,
    pub key: SeriesKey,
    pub kind: FindingKind,
    pub severity: Severity,
    pub observed_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(with = "crate::snapshot::timefmt")]
    pub first_seen: SystemTime,
    #[serde(with = "crate::snapshot::timefmt")]
    pub last_seen: SystemTime,
}

struct OpenState {
    finding: Finding,
    misses: u8,
}

struct Triggered {
    kind: FindingKind,
    severity: Severity,
    observed: f64,
    threshold: Option<f64>,
}

/// Evaluates window statistics against threshold, trend and volume rules and
/// maintains the set of open findings.
///
/// Single-consumer by design: the engine tick owns it and feeds it one
/// [`WindowStats`] per series per tick, so evaluation is deterministic for a
/// given input sequence.
pub struct AnalysisEngine {
    cfg: AnalysisConfig,
    next_id: u64,
    open: HashMap<(SeriesKey, FindingKind), OpenState>,
    /// EWMA of per-window sample counts, per series.
    baselines: HashMap<SeriesKey, f64>,
}

impl AnalysisEngine {
    pub fn new(cfg: AnalysisConfig) -> Self {
        Self {
            cfg,
            next_id: 1,
            open: HashMap::new(),
            baselines: HashMap::new(),
        }
    }

    /// Evaluates one window. Rule order is fixed; at most one finding per
    /// kind per series can be open at a time.
    pub fn evaluate(&mut self, stats: &WindowStats, now: SystemTime) {
        let triggered = [
            self.check_threshold(stats),
            self.check_trend(stats),
            self.check_volume(stats),
        ];

        for kind in [
            FindingKind::ThresholdBreach,
            FindingKind::TrendDegradation,
            FindingKind::VolumeAnomaly,
        ] {
            let hit = triggered
                .iter()
                .flatten()
                .find(|t| t.kind == kind);
            self.reconcile(&stats.key, kind, hit, now);
        }

        self.update_baseline(stats);
    }

    /// Open findings ordered by severity descending, then first-seen
    /// ascending.
    pub fn open_findings(&self) -> Vec<Finding> {
        let mut findings: Vec<Finding> =
            self.open.values().map(|s| s.finding.clone()).collect();
        findings.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.first_seen.cmp(&b.first_seen))
                .then(a.id.cmp(&b.id))
        });
        findings
    }

    fn reconcile(
        &mut self,
        key: &SeriesKey,
        kind: FindingKind,
        hit: Option<&Triggered>,
        now: SystemTime,
    ) {
        let map_key = (key.clone(), kind);

        match hit {
            Some(t) => match self.open.get_mut(&map_key) {
                Some(state) => {
                    state.finding.last_seen = now;
                    state.finding.observed_value = t.observed;
                    state.finding.severity = state.finding.severity.max(t.severity);
                    state.misses = 0;
                }
                None => {
                    let finding = Finding {
                        id: self.next_id,
                        key: key.clone(),
                        kind,
                        severity: t.severity,
                        observed_value: t.observed,
                        threshold: t.threshold,
                        first_seen: now,
                        last_seen: now,
                    };
                    self.next_id += 1;
                    tracing::debug!(
                        key = %key,
                        kind = kind.as_str(),
                        severity = finding.severity.as_str(),
                        observed = finding.observed_value,
                        "finding opened",
                    );
                    self.open.insert(map_key, OpenState { finding, misses: 0 });
                }
            },
            None => {
                // Two consecutive clear evaluations close the finding; one
                // borderline miss never flickers it.
                let cleared = match self.open.get_mut(&map_key) {
                    Some(state) => {
                        state.misses += 1;
                        state.misses >= 2
                    }
                    None => false,
                };
                if cleared {
                    self.open.remove(&map_key);
                    tracing::debug!(key = %key, kind = kind.as_str(), "finding cleared");
                }
            }
        }
    }

    fn check_threshold(&self, stats: &WindowStats) -> Option<Triggered> {
        if stats.is_empty() {
            return None;
        }
        let threshold = stats.threshold?;

        let observed = match self.cfg.threshold_source {
            ThresholdSource::Mean => stats.mean,
            ThresholdSource::Latest => stats.latest,
        };

        let margin = self.cfg.min_significance * threshold.abs();
        let excess = match self.polarity(stats) {
            Polarity::HigherIsWorse => observed - threshold,
            Polarity::LowerIsWorse => threshold - observed,
        };

        if excess < margin {
            return None;
        }

        let severity = if excess >= 2.0 * margin {
            Severity::Critical
        } else {
            Severity::Warning
        };

        Some(Triggered {
            kind: FindingKind::ThresholdBreach,
            severity,
            observed,
            threshold: Some(threshold),
        })
    }

    fn check_trend(&self, stats: &WindowStats) -> Option<Triggered> {
        if stats.count < 3 {
            return None;
        }

        let worsening = match self.polarity(stats) {
            Polarity::HigherIsWorse => stats.slope >= self.cfg.trend_slope_threshold,
            Polarity::LowerIsWorse => stats.slope <= -self.cfg.trend_slope_threshold,
        };

        if !worsening {
            return None;
        }

        Some(Triggered {
            kind: FindingKind::TrendDegradation,
            severity: Severity::Warning,
            observed: stats.slope,
            threshold: None,
        })
    }

    fn check_volume(&self, stats: &WindowStats) -> Option<Triggered> {
        let baseline = *self.baselines.get(&stats.key)?;
        if baseline < 1.0 {
            return None;
        }

        let count = stats.count as f64;
        let burst = count > baseline * self.cfg.volume_ratio;
        let silence = count < baseline / self.cfg.volume_ratio;
        if !burst && !silence {
            return None;
        }

        Some(Triggered {
            kind: FindingKind::VolumeAnomaly,
            severity: Severity::Info,
            observed: count,
            threshold: Some(baseline),
        })
    }

    fn update_baseline(&mut self, stats: &WindowStats) {
        let alpha = self.cfg.baseline_alpha;
        let count = stats.count as f64;
        self.baselines
            .entry(stats.key.clone())
            .and_modify(|b| *b = alpha * count + (1.0 - alpha) * *b)
            .or_insert(count);
    }

    fn polarity(&self, stats: &WindowStats) -> Polarity {
        if let Some(p) = self.cfg.polarity_overrides.get(stats.key.metric.as_ref()) {
            return *p;
        }
        stats
            .unit
            .map(|u| u.default_polarity())
            .unwrap_or(Polarity::HigherIsWorse)
    }
}
