use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::metrics::sample::Polarity;

/// Top-level configuration for the pulsehub engine.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Engine scheduling and capacity configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Threshold/trend/volume analysis configuration.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Recommendation ranking configuration.
    #[serde(default)]
    pub recommend: RecommendConfig,

    /// Trace collection configuration.
    #[serde(default)]
    pub trace: TraceConfig,

    /// Dashboard broadcast configuration.
    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

/// Engine scheduling and capacity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Periodic evaluation/broadcast interval. Default: 2s.
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Rolling window durations, shortest first. The first window drives
    /// analysis; all windows appear in snapshots. Default: [1m, 15m].
    #[serde(default = "default_windows")]
    pub windows: Vec<WindowDuration>,

    /// Per-series sample ring capacity. Default: 10000.
    #[serde(default = "default_sample_capacity")]
    pub sample_capacity: usize,

    /// Maximum recent traces carried per snapshot. Default: 50.
    #[serde(default = "default_recent_traces")]
    pub recent_traces: usize,
}

/// Humantime-parsed window duration entry.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WindowDuration(#[serde(with = "humantime_serde")] pub Duration);

/// Analysis rule configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Minimum significance margin for threshold breaches, as a fraction of
    /// the threshold. Default: 0.05.
    #[serde(default = "default_min_significance")]
    pub min_significance: f64,

    /// Which aggregate is compared against the threshold. Default: mean.
    #[serde(default)]
    pub threshold_source: ThresholdSource,

    /// Minimum slope magnitude (value-units/second) before a trend counts as
    /// degradation. Default: 1.0.
    #[serde(default = "default_trend_slope_threshold")]
    pub trend_slope_threshold: f64,

    /// Sample-count deviation ratio against the rolling baseline before a
    /// volume anomaly fires. Default: 3.0.
    #[serde(default = "default_volume_ratio")]
    pub volume_ratio: f64,

    /// EWMA factor for the rolling baseline count. Default: 0.3.
    #[serde(default = "default_baseline_alpha")]
    pub baseline_alpha: f64,

    /// Per-metric polarity overrides for metrics whose unit-derived
    /// degradation direction is wrong.
    #[serde(default)]
    pub polarity_overrides: HashMap<String, Polarity>,
}

/// Which aggregate the threshold rule compares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    #[default]
    Mean,
    Latest,
}

/// Recommendation ranking configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecommendConfig {
    /// Suppression interval for re-emitting a recommendation with the same
    /// group signature. Default: 10m.
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,

    /// Bound on retained recent recommendations. Default: 100.
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
}

/// Trace collection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceConfig {
    /// Open traces with no activity for this long become Abandoned.
    /// Default: 60s.
    #[serde(default = "default_stale_timeout", with = "humantime_serde")]
    pub stale_timeout: Duration,

    /// How long closed/abandoned traces stay in active tracking before
    /// eviction. Default: 5m.
    #[serde(default = "default_retention_after_close", with = "humantime_serde")]
    pub retention_after_close: Duration,

    /// Background garbage-collection sweep cadence. Default: 10s.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Bound on stored parent-unresolved spans per trace. Default: 64.
    #[serde(default = "default_max_pending_orphans")]
    pub max_pending_orphans: usize,
}

/// Dashboard broadcast configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    /// Per-client outbound queue capacity; oldest snapshots are dropped when
    /// a slow consumer falls behind. Default: 8.
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_windows() -> Vec<WindowDuration> {
    vec![
        WindowDuration(Duration::from_secs(60)),
        WindowDuration(Duration::from_secs(15 * 60)),
    ]
}

fn default_sample_capacity() -> usize {
    10_000
}

fn default_recent_traces() -> usize {
    50
}

fn default_min_significance() -> f64 {
    0.05
}

fn default_trend_slope_threshold() -> f64 {
    1.0
}

fn default_volume_ratio() -> f64 {
    3.0
}

fn default_baseline_alpha() -> f64 {
    0.3
}

fn default_cooldown() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_recent_limit() -> usize {
    100
}

fn default_stale_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_retention_after_close() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_max_pending_orphans() -> usize {
    64
}

fn default_client_queue_capacity() -> usize {
    8
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            engine: EngineConfig::default(),
            analysis: AnalysisConfig::default(),
            recommend: RecommendConfig::default(),
            trace: TraceConfig::default(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            windows: default_windows(),
            sample_capacity: default_sample_capacity(),
            recent_traces: default_recent_traces(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            min_significance: default_min_significance(),
            threshold_source: ThresholdSource::Mean,
            trend_slope_threshold: default_trend_slope_threshold(),
            volume_ratio: default_volume_ratio(),
            baseline_alpha: default_baseline_alpha(),
            polarity_overrides: HashMap::new(),
        }
    }
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            cooldown: default_cooldown(),
            recent_limit: default_recent_limit(),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            stale_timeout: default_stale_timeout(),
            retention_after_close: default_retention_after_close(),
            sweep_interval: default_sweep_interval(),
            max_pending_orphans: default_max_pending_orphans(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            client_queue_capacity: default_client_queue_capacity(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.engine.tick_interval.is_zero() {
            bail!("engine.tick_interval must be positive");
        }

        if self.engine.windows.is_empty() {
            bail!("engine.windows must not be empty");
        }
        let mut prev = Duration::ZERO;
        for w in &self.engine.windows {
            if w.0.is_zero() {
                bail!("engine.windows entries must be positive");
            }
            if w.0 <= prev {
                bail!("engine.windows must be strictly increasing");
            }
            prev = w.0;
        }

        if self.engine.sample_capacity == 0 {
            bail!("engine.sample_capacity must be positive");
        }
        if self.engine.recent_traces == 0 {
            bail!("engine.recent_traces must be positive");
        }

        if !(0.0..1.0).contains(&self.analysis.min_significance) {
            bail!("analysis.min_significance must be in [0, 1)");
        }
        if self.analysis.trend_slope_threshold <= 0.0 {
            bail!("analysis.trend_slope_threshold must be positive");
        }
        if self.analysis.volume_ratio <= 1.0 {
            bail!("analysis.volume_ratio must be greater than 1");
        }
        if !(self.analysis.baseline_alpha > 0.0 && self.analysis.baseline_alpha <= 1.0) {
            bail!("analysis.baseline_alpha must be in (0, 1]");
        }

        if self.recommend.cooldown.is_zero() {
            bail!("recommend.cooldown must be positive");
        }
        if self.recommend.recent_limit == 0 {
            bail!("recommend.recent_limit must be positive");
        }

        if self.trace.stale_timeout.is_zero() {
            bail!("trace.stale_timeout must be positive");
        }
        if self.trace.retention_after_close.is_zero() {
            bail!("trace.retention_after_close must be positive");
        }
        if self.trace.sweep_interval.is_zero() {
            bail!("trace.sweep_interval must be positive");
        }
        if self.trace.max_pending_orphans == 0 {
            bail!("trace.max_pending_orphans must be positive");
        }

        if self.broadcast.client_queue_capacity == 0 {
            bail!("broadcast.client_queue_capacity must be positive");
        }

        Ok(())
    }
}

impl EngineConfig {
    /// The shortest configured window; drives analysis rule evaluation.
    pub fn evaluation_window(&self) -> Duration {
        self.windows
            .first()
            .map(|w| w.0)
            .unwrap_or(Duration::from_secs(60))
    }

    /// All configured window durations, shortest first.
    pub fn window_durations(&self) -> Vec<Duration> {
        self.windows.iter().map(|w| w.0).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.engine.tick_interval, Duration::from_secs(2));
        assert_eq!(cfg.engine.sample_capacity, 10_000);
        assert_eq!(cfg.recommend.cooldown, Duration::from_secs(600));
        assert_eq!(cfg.broadcast.client_queue_capacity, 8);
    }

    #[test]
    fn test_evaluation_window_is_shortest() {
        let cfg = Config::default();
        assert_eq!(cfg.engine.evaluation_window(), Duration::from_secs(60));
        assert_eq!(cfg.engine.window_durations().len(), 2);
    }

    #[test]
    fn test_yaml_parse_with_humantime() {
        let yaml = r#"
log_level: debug
engine:
  tick_interval: 5s
  windows: [30s, 5m]
  sample_capacity: 500
trace:
  stale_timeout: 90s
analysis:
  polarity_overrides:
    cpu_pct: higher_is_worse
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.engine.tick_interval, Duration::from_secs(5));
        assert_eq!(cfg.engine.evaluation_window(), Duration::from_secs(30));
        assert_eq!(cfg.trace.stale_timeout, Duration::from_secs(90));
        assert_eq!(
            cfg.analysis.polarity_overrides.get("cpu_pct"),
            Some(&Polarity::HigherIsWorse)
        );
    }

    #[test]
    fn test_validation_rejects_zero_tick_interval() {
        let mut cfg = Config::default();
        cfg.engine.tick_interval = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("tick_interval"));
    }

    #[test]
    fn test_validation_rejects_empty_windows() {
        let mut cfg = Config::default();
        cfg.engine.windows.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("windows"));
    }

    #[test]
    fn test_validation_rejects_unordered_windows() {
        let mut cfg = Config::default();
        cfg.engine.windows = vec![
            WindowDuration(Duration::from_secs(60)),
            WindowDuration(Duration::from_secs(30)),
        ];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("strictly increasing"));
    }

    #[test]
    fn test_validation_rejects_bad_volume_ratio() {
        let mut cfg = Config::default();
        cfg.analysis.volume_ratio = 1.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("volume_ratio"));
    }

    #[test]
    fn test_validation_rejects_bad_baseline_alpha() {
        let mut cfg = Config::default();
        cfg.analysis.baseline_alpha = 0.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("baseline_alpha"));

        cfg.analysis.baseline_alpha = 1.5;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("baseline_alpha"));
    }

    #[test]
    fn test_validation_rejects_zero_queue_capacity() {
        let mut cfg = Config::default();
        cfg.broadcast.client_queue_capacity = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("client_queue_capacity"));
    }

    #[test]
    fn test_validation_rejects_min_significance_out_of_range() {
        let mut cfg = Config::default();
        cfg.analysis.min_significance = 1.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("min_significance"));
    }
}
