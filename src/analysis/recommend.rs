use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;

use crate::config::RecommendConfig;

use super::{Finding, FindingKind, Severity};

/// Actionable advice derived from one component's open findings.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub id: u64,
    /// Findings this recommendation was derived from.
    pub finding_ids: Vec<u64>,
    pub component: Arc<str>,
    pub title: String,
    pub rationale: String,
    pub severity: Severity,
    #[serde(with = "crate::snapshot::timefmt")]
    pub created_at: SystemTime,
    /// Until when advice with the same group signature is suppressed.
    #[serde(with = "crate::snapshot::timefmt")]
    pub suppress_until: SystemTime,
}

/// Groups open findings per component into ranked recommendations,
/// suppressing repeats of the same advice for a cooldown interval.
///
/// The cooldown key is the group signature (component plus the sorted set of
/// finding kinds), so new evidence of a different shape re-emits immediately
/// while an unchanged condition stays quiet.
pub struct RecommendationRanker {
    cfg: RecommendConfig,
    next_id: u64,
    cooldowns: HashMap<String, SystemTime>,
}

impl RecommendationRanker {
    pub fn new(cfg: RecommendConfig) -> Self {
        Self {
            cfg,
            next_id: 1,
            cooldowns: HashMap::new(),
        }
    }

    /// Produces recommendations newly emitted at `now`, ranked severity
    /// descending then newest first. Suppressed groups emit nothing.
    pub fn rank(&mut self, findings: &[Finding], now: SystemTime) -> Vec<Recommendation> {
        self.prune_expired(now);

        let mut by_component: HashMap<Arc<str>, Vec<&Finding>> = HashMap::new();
        for f in findings {
            by_component
                .entry(Arc::clone(&f.key.component))
                .or_default()
                .push(f);
        }

        let mut emitted = Vec::new();

        // Sorted component iteration keeps id assignment deterministic.
        let mut components: Vec<Arc<str>> = by_component.keys().cloned().collect();
        components.sort();

        for component in components {
            let group = &by_component[&component];
            let signature = group_signature(&component, group);

            if let Some(until) = self.cooldowns.get(&signature) {
                if now < *until {
                    tracing::debug!(component = %component, "recommendation suppressed by cooldown");
                    continue;
                }
            }

            let severity = group
                .iter()
                .map(|f| f.severity)
                .max()
                .unwrap_or(Severity::Info);

            let suppress_until = now + self.cfg.cooldown;
            let rec = Recommendation {
                id: self.next_id,
                finding_ids: group.iter().map(|f| f.id).collect(),
                component: Arc::clone(&component),
                title: title_for(&component, group),
                rationale: rationale_for(group),
                severity,
                created_at: now,
                suppress_until,
            };
            self.next_id += 1;

            self.cooldowns.insert(signature, suppress_until);
            tracing::info!(
                component = %component,
                severity = rec.severity.as_str(),
                findings = rec.finding_ids.len(),
                "recommendation emitted",
            );
            emitted.push(rec);
        }

        emitted.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.created_at.cmp(&a.created_at))
                .then(a.id.cmp(&b.id))
        });
        emitted
    }

    fn prune_expired(&mut self, now: SystemTime) {
        self.cooldowns.retain(|_, until| *until > now);
    }
}

fn group_signature(component: &str, group: &[&Finding]) -> String {
    let kinds: BTreeSet<&'static str> = group.iter().map(|f| f.kind.as_str()).collect();
    let mut sig = String::from(component);
    for kind in kinds {
        sig.push('|');
        sig.push_str(kind);
    }
    sig
}

fn title_for(component: &str, group: &[&Finding]) -> String {
    let dominant = group
        .iter()
        .max_by_key(|f| (f.severity, std::cmp::Reverse(f.first_seen)))
        .map(|f| f.kind)
        .unwrap_or(FindingKind::ThresholdBreach);

    match dominant {
        FindingKind::ThresholdBreach => {
            format!("Investigate threshold breaches in {component}")
        }
        FindingKind::TrendDegradation => {
            format!("Investigate degrading performance trend in {component}")
        }
        FindingKind::VolumeAnomaly => {
            format!("Check reporting volume from {component}")
        }
    }
}

fn rationale_for(group: &[&Finding]) -> String {
    let mut parts: Vec<String> = group
        .iter()
        .map(|f| match f.kind {
            FindingKind::ThresholdBreach => format!(
                "{} is at {:.2} against a threshold of {:.2}",
                f.key,
                f.observed_value,
                f.threshold.unwrap_or(f.observed_value),
            ),
            FindingKind::TrendDegradation => format!(
                "{} is trending worse at {:.3}/s",
                f.key, f.observed_value,
            ),
            FindingKind::VolumeAnomaly => format!(
                "{} reported {} samples against a baseline of {:.1}",
                f.key,
                f.observed_value as u64,
                f.threshold.unwrap_or(0.0),
            ),
        })
        .collect();
    parts.sort();
    parts.join("; ")
}
