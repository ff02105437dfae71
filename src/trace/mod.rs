use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TraceConfig;
use crate::error::IngestError;

/// Terminal status reported on a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
    Unset,
}

/// One unit of work inside a trace.
///
/// Spans may arrive twice for the same span id: once when the work starts
/// and again when it ends. The later arrival replaces the earlier one.
#[derive(Debug, Clone, Serialize)]
pub struct Span {
    pub trace_id: Arc<str>,
    pub span_id: Arc<str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<Arc<str>>,
    pub component: Arc<str>,
    pub operation: Arc<str>,
    #[serde(with = "crate::snapshot::timefmt")]
    pub start_time: SystemTime,
    #[serde(with = "crate::snapshot::timefmt::opt", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<SystemTime>,
    pub status: SpanStatus,
}

impl Span {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.trace_id.is_empty() {
            return Err(IngestError::InvalidSpan {
                reason: "missing trace id",
            });
        }
        if self.span_id.is_empty() {
            return Err(IngestError::InvalidSpan {
                reason: "missing span id",
            });
        }
        if self.component.is_empty() {
            return Err(IngestError::InvalidSpan {
                reason: "missing component",
            });
        }
        if self.operation.is_empty() {
            return Err(IngestError::InvalidSpan {
                reason: "missing operation",
            });
        }
        if let Some(end) = self.end_time {
            if end < self.start_time {
                return Err(IngestError::InvalidSpan {
                    reason: "end time before start time",
                });
            }
        }
        Ok(())
    }

    fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }
}

/// Lifecycle state of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceState {
    Open,
    Closed,
    Abandoned,
}

/// A trace: all spans seen for one trace id, plus lifecycle state.
#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub trace_id: Arc<str>,
    pub state: TraceState,
    /// Spans in arrival order.
    pub spans: Vec<Span>,
    #[serde(with = "crate::snapshot::timefmt")]
    pub last_activity: SystemTime,
    /// Spans currently waiting for a parent that has not arrived.
    #[serde(skip)]
    pending_orphans: usize,
    /// When the trace left the Open state.
    #[serde(skip)]
    terminal_at: Option<SystemTime>,
}

impl Trace {
    fn new(trace_id: Arc<str>, now: SystemTime) -> Self {
        Self {
            trace_id,
            state: TraceState::Open,
            spans: Vec::new(),
            last_activity: now,
            pending_orphans: 0,
            terminal_at: None,
        }
    }

    fn contains_span(&self, span_id: &str) -> bool {
        self.spans.iter().any(|s| s.span_id.as_ref() == span_id)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, TraceState::Open)
    }
}

/// How an ingested span was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanOutcome {
    Stored,
    /// Stored, but its parent span has not arrived yet.
    Orphaned,
}

/// Collects spans into traces and garbage-collects stale and terminal ones.
///
/// `DashMap` keyed by trace id gives per-trace locking; concurrent producers
/// on different traces never contend. The background sweep is the only
/// writer of state transitions besides root-span closure on the ingest path.
pub struct TraceCollector {
    cfg: TraceConfig,
    active: DashMap<Arc<str>, Trace>,
    recent: Mutex<VecDeque<Trace>>,
    recent_capacity: usize,
}

impl TraceCollector {
    pub fn new(cfg: TraceConfig, recent_capacity: usize) -> Self {
        Self {
            cfg,
            active: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(recent_capacity)),
            recent_capacity,
        }
    }

    /// Ingests one span, creating its trace on first sight.
    ///
    /// A root span arriving with an end time closes the trace. A span whose
    /// parent has not arrived is stored as an orphan and resolved when the
    /// parent shows up; per-trace orphan storage is bounded and overflow is
    /// discarded.
    pub fn ingest_span(&self, span: Span, now: SystemTime) -> Result<SpanOutcome, IngestError> {
        span.validate()?;

        let trace_id = Arc::clone(&span.trace_id);
        let mut trace = self
            .active
            .entry(trace_id)
            .or_insert_with(|| Trace::new(Arc::clone(&span.trace_id), now));

        let orphaned = match &span.parent_span_id {
            Some(parent) => !trace.contains_span(parent),
            None => false,
        };

        if orphaned && trace.pending_orphans >= self.cfg.max_pending_orphans {
            warn!(
                trace_id = %span.trace_id,
                span_id = %span.span_id,
                limit = self.cfg.max_pending_orphans,
                "orphan span limit reached, discarding span",
            );
            return Ok(SpanOutcome::Orphaned);
        }

        // A newly arrived span may be the missing parent of earlier orphans.
        let resolved = trace
            .spans
            .iter()
            .filter(|s| s.parent_span_id.as_deref() == Some(span.span_id.as_ref()))
            .count();
        trace.pending_orphans = trace.pending_orphans.saturating_sub(resolved);

        let closes = span.is_root() && span.end_time.is_some();

        match trace
            .spans
            .iter_mut()
            .find(|s| s.span_id == span.span_id)
        {
            Some(existing) => *existing = span,
            None => {
                if orphaned {
                    trace.pending_orphans += 1;
                    debug!(
                        trace_id = %trace.trace_id,
                        span_id = %span.span_id,
                        "orphan span stored, parent not yet seen",
                    );
                }
                trace.spans.push(span);
            }
        }

        if !trace.is_terminal() {
            trace.last_activity = now;
            if closes {
                trace.state = TraceState::Closed;
                trace.terminal_at = Some(now);
                self.push_recent(trace.clone());
                debug!(trace_id = %trace.trace_id, spans = trace.spans.len(), "trace closed");
            }
        }

        Ok(if orphaned {
            SpanOutcome::Orphaned
        } else {
            SpanOutcome::Stored
        })
    }

    /// One garbage-collection pass at `now`.
    ///
    /// Open traces idle past the stale timeout become Abandoned exactly once;
    /// terminal traces past their retention are evicted from active tracking.
    pub fn sweep(&self, now: SystemTime) {
        let mut abandoned = Vec::new();

        for mut entry in self.active.iter_mut() {
            let trace = entry.value_mut();
            if trace.state == TraceState::Open {
                let idle = now
                    .duration_since(trace.last_activity)
                    .unwrap_or_default();
                if idle > self.cfg.stale_timeout {
                    trace.state = TraceState::Abandoned;
                    trace.terminal_at = Some(now);
                    abandoned.push(trace.clone());
                }
            }
        }

        for trace in abandoned {
            debug!(
                trace_id = %trace.trace_id,
                spans = trace.spans.len(),
                "trace abandoned after stale timeout",
            );
            self.push_recent(trace);
        }

        self.active.retain(|_, trace| match trace.terminal_at {
            Some(at) => now.duration_since(at).unwrap_or_default() < self.cfg.retention_after_close,
            None => true,
        });
    }

    /// Spawns the background sweep task, stopped by `cancel`.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let collector = Arc::clone(self);
        let sweep_interval = self.cfg.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        collector.sweep(SystemTime::now());
                    }
                }
            }
        });
    }

    /// Most recently terminated traces, newest first, at most `limit`.
    pub fn recent_traces(&self, limit: usize) -> Vec<Trace> {
        match self.recent.lock() {
            Ok(recent) => recent.iter().rev().take(limit).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Number of traces currently tracked, terminal ones included.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn push_recent(&self, trace: Trace) {
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() >= self.recent_capacity {
                recent.pop_front();
            }
            recent.push_back(trace);
        }
    }
}
