use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pulsehub::analysis::{FindingKind, Severity};
use pulsehub::broadcast::AuthDecision;
use pulsehub::config::Config;
use pulsehub::engine::Engine;
use pulsehub::metrics::sample::{MetricSample, Unit};
use pulsehub::trace::{Span, SpanStatus, TraceState};

fn at(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn sample(
    component: &str,
    metric: &str,
    value: f64,
    offset_s: u64,
    threshold: Option<f64>,
) -> MetricSample {
    MetricSample {
        component: Arc::from(component),
        metric: Arc::from(metric),
        value,
        unit: Unit::Millis,
        wall_time: at(offset_s),
        mono_ns: offset_s * 1_000_000_000,
        threshold,
        target: None,
    }
}

fn span(trace_id: &str, span_id: &str, parent: Option<&str>, start_s: u64) -> Span {
    Span {
        trace_id: Arc::from(trace_id),
        span_id: Arc::from(span_id),
        parent_span_id: parent.map(Arc::from),
        component: Arc::from("api"),
        operation: Arc::from("handle_request"),
        start_time: at(start_s),
        end_time: None,
        status: SpanStatus::Unset,
    }
}

fn ended(mut s: Span, end_s: u64) -> Span {
    s.end_time = Some(at(end_s));
    s.status = SpanStatus::Ok;
    s
}

#[test]
fn pipeline_blackbox_correctness_and_invariants() {
    let engine = Engine::new(Config::default());

    // 10 components reporting healthy latency; one of them breaching its
    // threshold hard. 100 samples per component over the trailing minute.
    for c in 0..10u64 {
        let component = format!("svc-{c}");
        let value = if c == 3 { 250.0 } else { 40.0 };
        for i in 0..100u64 {
            engine
                .record_metric(sample(
                    &component,
                    "latency",
                    value,
                    1_000 + (i * 60) / 100,
                    Some(100.0),
                ))
                .expect("valid sample");
        }
    }

    // One trace closing cleanly before the tick.
    engine.record_span(span("t1", "root", None, 1_050), at(1_050)).expect("valid span");
    engine
        .record_span(span("t1", "db-query", Some("root"), 1_050), at(1_050))
        .expect("valid span");
    engine
        .record_span(ended(span("t1", "root", None, 1_050), 1_051), at(1_051))
        .expect("valid span");

    engine.tick(at(1_060));
    let snap = engine.current_snapshot().expect("snapshot after tick");

    // Every series appears in the stats for both configured windows.
    assert_eq!(snap.window_stats.len(), 10 * 2);
    for stats in &snap.window_stats {
        assert_eq!(stats.count, 100);
        assert!(stats.min <= stats.mean && stats.mean <= stats.max);
        assert!(stats.window_start < stats.window_end);
    }

    // Exactly one finding, on the breaching component, critical because the
    // excess is far past double the significance margin.
    assert_eq!(snap.findings.len(), 1);
    let finding = &snap.findings[0];
    assert_eq!(finding.key.component.as_ref(), "svc-3");
    assert_eq!(finding.kind, FindingKind::ThresholdBreach);
    assert_eq!(finding.severity, Severity::Critical);
    assert_eq!(finding.threshold, Some(100.0));

    // Exactly one recommendation, naming the breaching component.
    assert_eq!(snap.recommendations.len(), 1);
    let rec = &snap.recommendations[0];
    assert_eq!(rec.component.as_ref(), "svc-3");
    assert_eq!(rec.severity, Severity::Critical);
    assert_eq!(rec.finding_ids, vec![finding.id]);

    // The closed trace made it into the snapshot with all spans.
    assert_eq!(snap.recent_traces.len(), 1);
    assert_eq!(snap.recent_traces[0].state, TraceState::Closed);
    assert_eq!(snap.recent_traces[0].spans.len(), 2);
}

#[test]
fn pipeline_cooldown_and_clearing_across_ticks() {
    let engine = Engine::new(Config::default());

    for i in 0..50u64 {
        engine
            .record_metric(sample("api", "latency", 200.0, 1_000 + i, Some(100.0)))
            .expect("valid sample");
    }

    engine.tick(at(1_060));
    assert_eq!(engine.current_snapshot().expect("snapshot").findings.len(), 1);
    assert_eq!(engine.recommendations(Severity::Info).len(), 1);

    // The condition persists: the finding coalesces, the advice does not
    // repeat within the cooldown.
    engine.tick(at(1_062));
    engine.tick(at(1_064));
    let snap = engine.current_snapshot().expect("snapshot");
    assert_eq!(snap.findings.len(), 1);
    assert_eq!(engine.recommendations(Severity::Info).len(), 1);

    // The breaching samples age out of the evaluation window; after two
    // clear evaluations the finding closes.
    engine.tick(at(1_200));
    engine.tick(at(1_202));
    let snap = engine.current_snapshot().expect("snapshot");
    assert!(snap
        .findings
        .iter()
        .all(|f| f.kind != FindingKind::ThresholdBreach));
}

#[tokio::test]
async fn pipeline_broadcast_reaches_connected_clients() {
    let engine = Engine::new(Config::default());

    let client_a = engine.connect_client(AuthDecision::Accepted).expect("accepted");
    let client_b = engine.connect_client(AuthDecision::Accepted).expect("accepted");
    assert_eq!(engine.client_count(), 2);

    for i in 0..50u64 {
        engine
            .record_metric(sample("api", "latency", 200.0, 1_000 + i, Some(100.0)))
            .expect("valid sample");
    }
    engine.tick(at(1_060));

    for client in [&client_a, &client_b] {
        let payload = client.recv().await.expect("payload");
        assert!(payload.contains("\"component\":\"api\""));
        assert!(payload.contains("threshold_breach"));
        assert!(payload.contains("Investigate threshold breaches in api"));
    }

    // A late joiner is seeded with the latest snapshot without waiting for
    // the next tick.
    let late = engine.connect_client(AuthDecision::Accepted).expect("accepted");
    assert!(late.recv().await.expect("seeded payload").contains("threshold_breach"));
}

#[test]
fn pipeline_snapshot_sink_observes_every_tick() {
    let seen: Arc<Mutex<Vec<SystemTime>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);

    let engine = Engine::new(Config::default()).with_sink(Box::new(move |snap| {
        sink_seen.lock().expect("sink lock").push(snap.timestamp);
        Ok(())
    }));

    engine.record_metric(sample("api", "latency", 40.0, 1_000, None)).expect("valid sample");
    engine.tick(at(1_010));
    engine.tick(at(1_020));

    assert_eq!(*seen.lock().expect("lock"), vec![at(1_010), at(1_020)]);
}

#[tokio::test]
async fn pipeline_graceful_shutdown_ends_client_streams() {
    let engine = Arc::new(Engine::new(Config::default()));
    engine.start();

    let client = engine.connect_client(AuthDecision::Accepted).expect("accepted");

    engine.record_metric(sample("api", "latency", 40.0, 1_000, None)).expect("valid sample");
    engine.tick(at(1_010));
    assert!(client.recv().await.is_some());

    engine.stop().await;

    // The background tick may have queued more snapshots; the stream drains
    // them and then ends. Ingestion and connection are rejected.
    while client.recv().await.is_some() {}
    assert!(engine.record_metric(sample("api", "latency", 1.0, 0, None)).is_err());
    assert!(engine.connect_client(AuthDecision::Accepted).is_err());
}
