use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::snapshot::DashboardSnapshot;

/// Result of the connection authorization hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Accepted,
    Rejected,
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("connection rejected")]
    Rejected,
    #[error("hub is shut down")]
    Closed,
}

/// What a publish did across all connected clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishReport {
    pub clients: usize,
    /// Snapshots dropped from slow consumers to make room.
    pub drops: u64,
}

struct ClientQueue {
    queue: Mutex<VecDeque<Arc<str>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl ClientQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueues one serialized snapshot, dropping the oldest on overflow.
    /// Returns the number of drops (0 or 1).
    fn push(&self, payload: Arc<str>, capacity: usize) -> u64 {
        let dropped = match self.queue.lock() {
            Ok(mut queue) => {
                let dropped = if queue.len() >= capacity {
                    queue.pop_front();
                    1
                } else {
                    0
                };
                queue.push_back(payload);
                dropped
            }
            Err(_) => return 0,
        };
        self.notify.notify_one();
        dropped
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Fan-out hub delivering serialized snapshots to connected dashboard
/// clients.
///
/// Each snapshot is serialized once and shared as `Arc<str>` across all
/// client queues. A slow consumer loses its oldest queued snapshots rather
/// than stalling the publisher; the newest snapshot always survives.
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    clients: DashMap<u64, Arc<ClientQueue>>,
    next_id: AtomicU64,
    /// Last published payload, used to seed late-joining clients.
    latest: Mutex<Option<Arc<str>>>,
    closed: AtomicBool,
    queue_capacity: usize,
}

impl BroadcastHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                clients: DashMap::new(),
                next_id: AtomicU64::new(1),
                latest: Mutex::new(None),
                closed: AtomicBool::new(false),
                queue_capacity,
            }),
        }
    }

    /// Registers a client, seeding its queue with the latest snapshot so a
    /// late joiner renders immediately instead of waiting a full tick.
    pub fn connect(&self, auth: AuthDecision) -> Result<ClientHandle, ConnectError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ConnectError::Closed);
        }
        if auth == AuthDecision::Rejected {
            return Err(ConnectError::Rejected);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(ClientQueue::new(self.inner.queue_capacity));

        if let Ok(latest) = self.inner.latest.lock() {
            if let Some(payload) = latest.as_ref() {
                queue.push(Arc::clone(payload), self.inner.queue_capacity);
            }
        }

        self.inner.clients.insert(id, Arc::clone(&queue));
        debug!(client_id = id, clients = self.inner.clients.len(), "client connected");

        Ok(ClientHandle {
            id,
            queue,
            hub: Arc::clone(&self.inner),
        })
    }

    /// Serializes `snapshot` once and enqueues it for every client.
    pub fn publish(&self, snapshot: &DashboardSnapshot) -> Result<PublishReport, serde_json::Error> {
        let payload: Arc<str> = Arc::from(serde_json::to_string(snapshot)?);

        if let Ok(mut latest) = self.inner.latest.lock() {
            *latest = Some(Arc::clone(&payload));
        }

        let mut report = PublishReport::default();
        for entry in self.inner.clients.iter() {
            report.clients += 1;
            report.drops += entry.value().push(Arc::clone(&payload), self.inner.queue_capacity);
        }

        if report.drops > 0 {
            warn!(drops = report.drops, "slow consumers dropped snapshots");
        }

        Ok(report)
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Closes all client queues and rejects further connections. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in self.inner.clients.iter() {
            entry.value().close();
        }
        self.inner.clients.clear();
        debug!("broadcast hub shut down");
    }
}

/// Receiving side of one client connection.
///
/// Dropping the handle unregisters the client from the hub.
pub struct ClientHandle {
    id: u64,
    queue: Arc<ClientQueue>,
    hub: Arc<HubInner>,
}

impl ClientHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next snapshot. Returns `None` once the hub has shut
    /// down and the queue is drained.
    ///
    /// Relies on `Notify` permit semantics: a `notify_one` racing a pop is
    /// stored as a permit, so a payload enqueued between the empty check and
    /// `notified().await` is never missed.
    pub async fn recv(&self) -> Option<Arc<str>> {
        loop {
            if let Ok(mut queue) = self.queue.queue.lock() {
                if let Some(payload) = queue.pop_front() {
                    return Some(payload);
                }
            }

            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }

            self.queue.notified().await;
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.hub.clients.remove(&self.id);
        debug!(client_id = self.id, "client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    fn snapshot(secs: u64) -> DashboardSnapshot {
        DashboardSnapshot {
            timestamp: UNIX_EPOCH + Duration::from_secs(secs),
            window_stats: Vec::new(),
            findings: Vec::new(),
            recommendations: Vec::new(),
            recent_traces: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_connected_client_receives_published_snapshot() {
        let hub = BroadcastHub::new(8);
        let client = hub.connect(AuthDecision::Accepted).expect("accepted");

        let report = hub.publish(&snapshot(1)).expect("serializable");
        assert_eq!(report.clients, 1);
        assert_eq!(report.drops, 0);

        let payload = client.recv().await.expect("payload");
        assert!(payload.contains("\"timestamp\""));
    }

    #[tokio::test]
    async fn test_rejected_auth_never_registers() {
        let hub = BroadcastHub::new(8);
        assert!(matches!(
            hub.connect(AuthDecision::Rejected),
            Err(ConnectError::Rejected),
        ));
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_late_joiner_is_seeded_with_latest() {
        let hub = BroadcastHub::new(8);
        hub.publish(&snapshot(1)).expect("serializable");
        hub.publish(&snapshot(2)).expect("serializable");

        let client = hub.connect(AuthDecision::Accepted).expect("accepted");
        let payload = client.recv().await.expect("seeded");
        // Only the latest snapshot is seeded.
        assert!(payload.contains("1970-01-01T00:00:02"));
    }

    #[tokio::test]
    async fn test_slow_consumer_drops_oldest_keeps_newest() {
        let hub = BroadcastHub::new(2);
        let client = hub.connect(AuthDecision::Accepted).expect("accepted");

        let mut drops = 0;
        for i in 1..=5u64 {
            drops += hub.publish(&snapshot(i)).expect("serializable").drops;
        }
        assert_eq!(drops, 3);

        let first = client.recv().await.expect("payload");
        let second = client.recv().await.expect("payload");
        assert!(first.contains("1970-01-01T00:00:04"));
        assert!(second.contains("1970-01-01T00:00:05"));
    }

    #[tokio::test]
    async fn test_slow_client_does_not_affect_others() {
        let hub = BroadcastHub::new(2);
        let slow = hub.connect(AuthDecision::Accepted).expect("accepted");
        let fast = hub.connect(AuthDecision::Accepted).expect("accepted");

        for i in 1..=3u64 {
            hub.publish(&snapshot(i)).expect("serializable");
            // The fast client drains as it goes.
            fast.recv().await.expect("payload");
        }

        // The slow client lost only its own oldest snapshot.
        assert!(slow.recv().await.expect("payload").contains("00:00:02"));
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let hub = BroadcastHub::new(8);
        let client = hub.connect(AuthDecision::Accepted).expect("accepted");
        assert_eq!(hub.client_count(), 1);

        drop(client);
        assert_eq!(hub.client_count(), 0);

        // Publishing after disconnect reaches nobody.
        let report = hub.publish(&snapshot(1)).expect("serializable");
        assert_eq!(report.clients, 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_ends_stream() {
        let hub = BroadcastHub::new(8);
        let client = hub.connect(AuthDecision::Accepted).expect("accepted");
        hub.publish(&snapshot(1)).expect("serializable");

        hub.shutdown();
        hub.shutdown(); // idempotent

        // Queued payload is still delivered, then the stream ends.
        assert!(client.recv().await.is_some());
        assert!(client.recv().await.is_none());

        assert!(matches!(
            hub.connect(AuthDecision::Accepted),
            Err(ConnectError::Closed),
        ));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let hub = BroadcastHub::new(8);
        let client = hub.connect(AuthDecision::Accepted).expect("accepted");

        let waiter = tokio::spawn(async move { client.recv().await });
        tokio::task::yield_now().await;

        hub.publish(&snapshot(7)).expect("serializable");
        let payload = waiter.await.expect("task").expect("payload");
        assert!(payload.contains("00:00:07"));
    }
}
