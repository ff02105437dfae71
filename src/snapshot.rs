use std::time::SystemTime;

use serde::Serialize;

use crate::analysis::recommend::Recommendation;
use crate::analysis::Finding;
use crate::metrics::window::WindowStats;
use crate::trace::Trace;

/// Immutable point-in-time summary broadcast to dashboard clients.
///
/// Each snapshot supersedes the previous one; clients render whatever they
/// last received. Serialized once per publish and shared across clients.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    #[serde(with = "timefmt")]
    pub timestamp: SystemTime,
    /// Per-series window statistics, ordered by series key.
    pub window_stats: Vec<WindowStats>,
    /// Open findings, severity descending then first-seen ascending.
    pub findings: Vec<Finding>,
    /// Recent recommendations, severity descending then newest first.
    pub recommendations: Vec<Recommendation>,
    /// Recently closed or abandoned traces, newest first, bounded.
    pub recent_traces: Vec<Trace>,
}

/// RFC 3339 serialization for `SystemTime` fields in the wire format.
pub mod timefmt {
    use std::time::SystemTime;

    use chrono::{DateTime, Utc};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let dt: DateTime<Utc> = (*t).into();
        s.serialize_str(&dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
    }

    pub mod opt {
        use std::time::SystemTime;

        use serde::Serializer;

        pub fn serialize<S: Serializer>(
            t: &Option<SystemTime>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => super::serialize(t, s),
                None => s.serialize_none(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    #[test]
    fn test_snapshot_serializes_to_json() {
        let snap = DashboardSnapshot {
            timestamp: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            window_stats: Vec::new(),
            findings: Vec::new(),
            recommendations: Vec::new(),
            recent_traces: Vec::new(),
        };

        let json = serde_json::to_value(&snap).expect("serializable");
        assert!(json["timestamp"]
            .as_str()
            .expect("timestamp string")
            .starts_with("2023-11-14T"));
        assert!(json["window_stats"].as_array().expect("array").is_empty());
    }
}
