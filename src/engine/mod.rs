pub mod stats;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analysis::recommend::{Recommendation, RecommendationRanker};
use crate::analysis::{AnalysisEngine, Severity};
use crate::broadcast::{AuthDecision, BroadcastHub, ClientHandle, ConnectError};
use crate::config::Config;
use crate::error::IngestError;
use crate::metrics::buffer::SampleBuffer;
use crate::metrics::sample::MetricSample;
use crate::metrics::window::WindowAggregator;
use crate::snapshot::DashboardSnapshot;
use crate::trace::{Span, SpanOutcome, Trace, TraceCollector};

use self::stats::{CounterKind, EngineStats};

/// Optional callback invoked with every published snapshot, for callers
/// that persist or forward snapshots out of process. Failures are counted
/// and logged, never propagated into the tick.
pub type SnapshotSink = Box<dyn Fn(&DashboardSnapshot) -> anyhow::Result<()> + Send + Sync>;

/// State owned by the evaluation tick. One lock, taken once per tick and by
/// read-side queries.
struct AnalysisState {
    analysis: AnalysisEngine,
    ranker: RecommendationRanker,
    /// Recently emitted recommendations, oldest first, bounded.
    recent_recs: VecDeque<Recommendation>,
}

/// Engine orchestrates all components: sample buffer, window aggregation,
/// analysis, recommendations, trace collection and the broadcast hub.
pub struct Engine {
    cfg: Config,
    buffer: Arc<SampleBuffer>,
    aggregator: WindowAggregator,
    traces: Arc<TraceCollector>,
    hub: BroadcastHub,
    stats: Arc<EngineStats>,
    analysis: Mutex<AnalysisState>,
    latest: Mutex<Option<DashboardSnapshot>>,
    sink: Option<SnapshotSink>,
    cancel: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(cfg: Config) -> Self {
        let buffer = Arc::new(SampleBuffer::new(cfg.engine.sample_capacity));
        let traces = Arc::new(TraceCollector::new(
            cfg.trace.clone(),
            cfg.engine.recent_traces,
        ));
        let hub = BroadcastHub::new(cfg.broadcast.client_queue_capacity);

        Self {
            aggregator: WindowAggregator::new(Arc::clone(&buffer)),
            analysis: Mutex::new(AnalysisState {
                analysis: AnalysisEngine::new(cfg.analysis.clone()),
                ranker: RecommendationRanker::new(cfg.recommend.clone()),
                recent_recs: VecDeque::with_capacity(cfg.recommend.recent_limit),
            }),
            buffer,
            traces,
            hub,
            stats: Arc::new(EngineStats::new()),
            latest: Mutex::new(None),
            sink: None,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            cfg,
        }
    }

    /// Installs a snapshot sink. Must be called before [`Engine::start`].
    pub fn with_sink(mut self, sink: SnapshotSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Starts the periodic evaluation tick, the trace sweep and the stats
    /// reporter.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        self.traces.start(self.cancel.child_token());
        self.spawn_tick_loop();
        self.spawn_stats_reporter();

        info!(
            tick_interval = ?self.cfg.engine.tick_interval,
            windows = self.cfg.engine.windows.len(),
            sample_capacity = self.cfg.engine.sample_capacity,
            "engine started",
        );
    }

    /// Gracefully stops all background tasks, rejects further ingestion and
    /// ends every client stream. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cancel.cancel();
        self.hub.shutdown();

        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "background task panicked during shutdown");
            }
        }

        info!("engine stopped");
    }

    /// Records one metric sample into its series ring.
    pub fn record_metric(&self, sample: MetricSample) -> Result<(), IngestError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(IngestError::Stopped);
        }

        match self.buffer.record(sample) {
            Ok(evicted) => {
                if evicted {
                    self.stats.record(CounterKind::EvictedSample);
                }
                Ok(())
            }
            Err(e) => {
                self.stats.record(CounterKind::InvalidSample);
                Err(e)
            }
        }
    }

    /// Records one span into its trace.
    pub fn record_span(&self, span: Span, now: SystemTime) -> Result<(), IngestError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(IngestError::Stopped);
        }

        match self.traces.ingest_span(span, now) {
            Ok(SpanOutcome::Stored) => Ok(()),
            Ok(SpanOutcome::Orphaned) => {
                self.stats.record(CounterKind::OrphanSpan);
                Ok(())
            }
            Err(e) => {
                self.stats.record(CounterKind::InvalidSpan);
                Err(e)
            }
        }
    }

    /// Registers a dashboard client on the broadcast hub.
    pub fn connect_client(&self, auth: AuthDecision) -> Result<ClientHandle, ConnectError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ConnectError::Closed);
        }
        self.hub.connect(auth)
    }

    /// One full evaluation pass at `now`: aggregate every series over every
    /// window, run analysis on the shortest window, rank recommendations,
    /// then store and broadcast the resulting snapshot.
    ///
    /// Runs on the tick task in production; callable directly with a pinned
    /// clock for deterministic evaluation.
    pub fn tick(&self, now: SystemTime) {
        let keys = self.buffer.keys();
        let windows = self.cfg.engine.window_durations();
        let eval_window = self.cfg.engine.evaluation_window();

        let mut window_stats = Vec::with_capacity(keys.len() * windows.len());
        let mut eval_stats = Vec::with_capacity(keys.len());

        for key in &keys {
            for window in &windows {
                let stats = self.aggregator.compute(key, *window, now);
                if *window == eval_window {
                    eval_stats.push(stats.clone());
                }
                if !stats.is_empty() {
                    window_stats.push(stats);
                }
            }
        }

        let (findings, recommendations) = match self.analysis.lock() {
            Ok(mut state) => {
                // Empty windows are evaluated too: silence against an
                // established baseline is itself a signal.
                for stats in &eval_stats {
                    state.analysis.evaluate(stats, now);
                }

                let findings = state.analysis.open_findings();
                let new_recs = state.ranker.rank(&findings, now);

                for rec in new_recs {
                    if state.recent_recs.len() >= self.cfg.recommend.recent_limit {
                        state.recent_recs.pop_front();
                    }
                    state.recent_recs.push_back(rec);
                }

                let mut recommendations: Vec<Recommendation> =
                    state.recent_recs.iter().cloned().collect();
                recommendations.sort_by(|a, b| {
                    b.severity
                        .cmp(&a.severity)
                        .then(b.created_at.cmp(&a.created_at))
                        .then(a.id.cmp(&b.id))
                });

                (findings, recommendations)
            }
            Err(_) => return,
        };

        let snapshot = DashboardSnapshot {
            timestamp: now,
            window_stats,
            findings,
            recommendations,
            recent_traces: self.traces.recent_traces(self.cfg.engine.recent_traces),
        };

        if let Some(sink) = &self.sink {
            if let Err(e) = sink(&snapshot) {
                self.stats.record(CounterKind::SinkFailure);
                warn!(error = %e, "snapshot sink failed");
            }
        }

        match self.hub.publish(&snapshot) {
            Ok(report) => {
                if report.drops > 0 {
                    self.stats.record_n(CounterKind::SlowConsumerDrop, report.drops);
                }
            }
            Err(e) => {
                error!(error = %e, "snapshot serialization failed");
            }
        }

        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(snapshot);
        }

        self.stats.record(CounterKind::TickCompleted);
    }

    /// The most recently published snapshot, if any tick has run.
    pub fn current_snapshot(&self) -> Option<DashboardSnapshot> {
        self.latest.lock().ok().and_then(|l| l.clone())
    }

    /// Most recently terminated traces, newest first, at most `limit`.
    pub fn recent_traces(&self, limit: usize) -> Vec<Trace> {
        self.traces.recent_traces(limit)
    }

    /// Recent recommendations at or above `min_severity`, severity
    /// descending then newest first.
    pub fn recommendations(&self, min_severity: Severity) -> Vec<Recommendation> {
        let mut recs: Vec<Recommendation> = match self.analysis.lock() {
            Ok(state) => state
                .recent_recs
                .iter()
                .filter(|r| r.severity >= min_severity)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        };
        recs.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.created_at.cmp(&a.created_at))
                .then(a.id.cmp(&b.id))
        });
        recs
    }

    pub fn client_count(&self) -> usize {
        self.hub.client_count()
    }

    fn spawn_tick_loop(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let cancel = self.cancel.clone();
        let tick_interval = self.cfg.engine.tick_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        engine.tick(SystemTime::now());

                        let elapsed = started.elapsed();
                        if elapsed > tick_interval {
                            engine.stats.record(CounterKind::TickOverrun);
                            warn!(
                                elapsed = ?elapsed,
                                interval = ?tick_interval,
                                "evaluation tick overran its interval",
                            );
                        }
                    }
                }
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    fn spawn_stats_reporter(self: &Arc<Self>) {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = stats.snapshot();
                        let total: u64 = snapshot.iter().map(|(_, n)| n).sum();

                        if total == 0 {
                            continue;
                        }

                        info!(events = total, "engine stats (60s)");

                        for (kind, count) in &snapshot {
                            debug!(kind = %kind, count, "  by kind (60s)");
                        }
                    }
                }
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }
}
