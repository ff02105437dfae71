use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Measurement unit attached to a metric sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Millis,
    Percent,
    Count,
    Bytes,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Millis => "ms",
            Self::Percent => "%",
            Self::Count => "count",
            Self::Bytes => "bytes",
        }
    }

    /// Default "which direction is bad" semantic for the unit.
    ///
    /// Latencies, byte volumes and raw counts degrade upward; percentages are
    /// treated as success-rate style values that degrade downward. Metrics
    /// that deviate from this can be overridden per metric in the analysis
    /// configuration.
    pub fn default_polarity(&self) -> Polarity {
        match self {
            Self::Millis | Self::Count | Self::Bytes => Polarity::HigherIsWorse,
            Self::Percent => Polarity::LowerIsWorse,
        }
    }
}

/// Direction in which a metric degrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    HigherIsWorse,
    LowerIsWorse,
}

/// Identity of one metric time series: (component, metric).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SeriesKey {
    pub component: Arc<str>,
    pub metric: Arc<str>,
}

impl SeriesKey {
    pub fn new(component: &str, metric: &str) -> Self {
        Self {
            component: Arc::from(component),
            metric: Arc::from(metric),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.component, self.metric)
    }
}

/// One timestamped measurement from an instrumented component.
///
/// Immutable once recorded. Carries both a wall-clock timestamp (used for
/// windowing and display) and the producer's monotonic clock reading in
/// nanoseconds (immune to wall-clock steps, kept for ordering diagnostics).
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub component: Arc<str>,
    pub metric: Arc<str>,
    pub value: f64,
    pub unit: Unit,
    #[serde(with = "crate::snapshot::timefmt")]
    pub wall_time: SystemTime,
    pub mono_ns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
}

impl MetricSample {
    /// Series identity for this sample. Cheap: clones two `Arc`s.
    pub fn key(&self) -> SeriesKey {
        SeriesKey {
            component: Arc::clone(&self.component),
            metric: Arc::clone(&self.metric),
        }
    }

    /// Validate the sample at the ingestion boundary.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.component.is_empty() {
            return Err(IngestError::InvalidSample {
                reason: "missing component",
            });
        }
        if self.metric.is_empty() {
            return Err(IngestError::InvalidSample {
                reason: "missing metric",
            });
        }
        if !self.value.is_finite() {
            return Err(IngestError::InvalidSample {
                reason: "non-finite value",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(component: &str, metric: &str, value: f64) -> MetricSample {
        MetricSample {
            component: Arc::from(component),
            metric: Arc::from(metric),
            value,
            unit: Unit::Millis,
            wall_time: SystemTime::UNIX_EPOCH,
            mono_ns: 0,
            threshold: None,
            target: None,
        }
    }

    #[test]
    fn test_validate_accepts_well_formed_sample() {
        assert!(sample("api", "latency", 12.5).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_component() {
        let err = sample("", "latency", 1.0).validate().unwrap_err();
        assert!(err.to_string().contains("missing component"));
    }

    #[test]
    fn test_validate_rejects_missing_metric() {
        let err = sample("api", "", 1.0).validate().unwrap_err();
        assert!(err.to_string().contains("missing metric"));
    }

    #[test]
    fn test_validate_rejects_non_finite_value() {
        assert!(sample("api", "latency", f64::NAN).validate().is_err());
        assert!(sample("api", "latency", f64::INFINITY).validate().is_err());
    }

    #[test]
    fn test_unit_default_polarity() {
        assert_eq!(Unit::Millis.default_polarity(), Polarity::HigherIsWorse);
        assert_eq!(Unit::Percent.default_polarity(), Polarity::LowerIsWorse);
    }

    #[test]
    fn test_series_key_display() {
        assert_eq!(SeriesKey::new("api", "latency").to_string(), "api/latency");
    }
}
