pub mod ws;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::store::InsightRecord;

/// What gets pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Insight(InsightRecord),
    ChainMilestone { height: u64, hash: String },
    ReorgNotice { ancestor_height: u64 },
}

/// What a connection is allowed to see. Authentication happens elsewhere;
/// the registry only filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionScope {
    /// Insights plus chain milestones (authenticated subscribers).
    Full,
    /// Insights only, seeded with the rolling recent window (anonymous).
    RecentOnly,
}

/// Bounded per-connection send queue. `push` never blocks: on overflow the
/// oldest pending event is dropped so one slow consumer cannot stall the
/// broadcaster.
#[derive(Debug)]
pub struct ConnectionQueue {
    buf: Mutex<VecDeque<OutboundEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, event: OutboundEvent) {
        {
            let mut buf = self.buf.lock().unwrap();
            if buf.len() == self.capacity {
                buf.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buf.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Wake the consumer for the last time. Called when the connection is
    /// removed from the registry so the drain loop does not park forever on
    /// a queue nothing will ever push to again.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // There is a single consumer per queue; notify_one leaves a permit
        // even if it is not parked yet.
        self.notify.notify_one();
    }

    /// Await the next pending event; `None` once the queue is closed.
    pub async fn next(&self) -> Option<OutboundEvent> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(ev) = self.buf.lock().unwrap().pop_front() {
                return Some(ev);
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.buf.lock().unwrap().len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct ConnEntry {
    subject: Option<String>,
    scope: SubscriptionScope,
    queue: Arc<ConnectionQueue>,
    last_heartbeat: Instant,
}

/// Registry of live subscriber connections. Explicitly owned (no globals);
/// register/unregister/broadcast are each safe for concurrent callers.
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<u64, ConnEntry>>,
    next_id: AtomicU64,
    recent: Mutex<VecDeque<InsightRecord>>,
    recent_cap: usize,
    queue_capacity: usize,
    heartbeat_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize, recent_cap: usize, heartbeat_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            recent: Mutex::new(VecDeque::with_capacity(recent_cap)),
            recent_cap: recent_cap.max(1),
            queue_capacity,
            heartbeat_timeout,
        }
    }

    /// Add a connection; anonymous connections get the rolling recent-insight
    /// window replayed into their queue on connect.
    pub fn register(
        &self,
        subject: Option<String>,
        scope: SubscriptionScope,
    ) -> (u64, Arc<ConnectionQueue>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(ConnectionQueue::new(self.queue_capacity));
        if scope == SubscriptionScope::RecentOnly {
            for insight in self.recent.lock().unwrap().iter() {
                queue.push(OutboundEvent::Insight(insight.clone()));
            }
        }
        info!(connection = id, subject = ?subject, "connection registered");
        self.inner.lock().unwrap().insert(
            id,
            ConnEntry {
                subject,
                scope,
                queue: queue.clone(),
                last_heartbeat: Instant::now(),
            },
        );
        (id, queue)
    }

    pub fn unregister(&self, id: u64) -> bool {
        let removed = self.inner.lock().unwrap().remove(&id);
        if let Some(entry) = &removed {
            entry.queue.close();
            info!(connection = id, "connection unregistered");
        }
        removed.is_some()
    }

    /// Best-effort, non-blocking fan-out: every live connection in scope gets
    /// the event pushed onto its bounded queue.
    pub fn broadcast(&self, event: &OutboundEvent) {
        if let OutboundEvent::Insight(insight) = event {
            let mut recent = self.recent.lock().unwrap();
            if recent.len() == self.recent_cap {
                recent.pop_front();
            }
            recent.push_back(insight.clone());
        }

        let conns = self.inner.lock().unwrap();
        for entry in conns.values() {
            let in_scope = match entry.scope {
                SubscriptionScope::Full => true,
                SubscriptionScope::RecentOnly => matches!(event, OutboundEvent::Insight(_)),
            };
            if in_scope {
                entry.queue.push(event.clone());
            }
        }
        debug!(connections = conns.len(), "event broadcast");
    }

    pub fn record_heartbeat(&self, id: u64) -> bool {
        match self.inner.lock().unwrap().get_mut(&id) {
            Some(entry) => {
                entry.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Drop connections whose heartbeat is older than the timeout, closing
    /// their queues so the owning socket tasks shut down. Returns the ids
    /// removed.
    pub fn sweep_stale(&self) -> Vec<u64> {
        let now = Instant::now();
        let mut conns = self.inner.lock().unwrap();
        let stale: Vec<u64> = conns
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_heartbeat) > self.heartbeat_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(entry) = conns.remove(id) {
                entry.queue.close();
            }
            info!(connection = id, "connection dropped after missed heartbeats");
        }
        stale
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Preload the recent-insight replay ring, oldest first. Used at startup
    /// so the anonymous replay window survives a restart.
    pub fn seed_recent(&self, insights: impl IntoIterator<Item = InsightRecord>) {
        let mut recent = self.recent.lock().unwrap();
        for insight in insights {
            if recent.len() == self.recent_cap {
                recent.pop_front();
            }
            recent.push_back(insight);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insight(id: i64, headline: &str) -> InsightRecord {
        InsightRecord {
            id,
            signal_id: id,
            category: "exchange_flow".into(),
            headline: headline.into(),
            summary: "s".into(),
            evidence: vec![crate::store::EvidenceRef::Block(100)],
            confidence: 0.9,
            created_at: "2026-01-01 00:00:00".into(),
            chart_url: None,
        }
    }

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(8, 5, Duration::from_secs(90))
    }

    #[test]
    fn broadcast_reaches_every_connection_once() {
        let reg = registry();
        let queues: Vec<_> = (0..100)
            .map(|_| reg.register(None, SubscriptionScope::Full).1)
            .collect();
        reg.broadcast(&OutboundEvent::Insight(insight(1, "hello")));
        for q in &queues {
            assert_eq!(q.len(), 1);
        }
    }

    #[test]
    fn saturated_queue_drops_oldest_without_blocking() {
        let reg = registry();
        let (_, q) = reg.register(None, SubscriptionScope::Full);
        // Saturate with milestones.
        for h in 1..=8u64 {
            reg.broadcast(&OutboundEvent::ChainMilestone {
                height: h,
                hash: format!("h{h}"),
            });
        }
        assert_eq!(q.len(), 8);
        // One more event: oldest milestone goes, insight arrives.
        reg.broadcast(&OutboundEvent::Insight(insight(1, "fresh")));
        assert_eq!(q.len(), 8);
        assert_eq!(q.dropped(), 1);
    }

    #[tokio::test]
    async fn queue_next_drains_in_order() {
        let reg = registry();
        let (_, q) = reg.register(None, SubscriptionScope::Full);
        reg.broadcast(&OutboundEvent::ChainMilestone {
            height: 1,
            hash: "a".into(),
        });
        reg.broadcast(&OutboundEvent::ChainMilestone {
            height: 2,
            hash: "b".into(),
        });
        let first = q.next().await;
        let second = q.next().await;
        assert!(matches!(
            first,
            Some(OutboundEvent::ChainMilestone { height: 1, .. })
        ));
        assert!(matches!(
            second,
            Some(OutboundEvent::ChainMilestone { height: 2, .. })
        ));
    }

    #[test]
    fn anonymous_scope_skips_milestones_but_gets_insights() {
        let reg = registry();
        let (_, anon) = reg.register(None, SubscriptionScope::RecentOnly);
        let (_, auth) = reg.register(Some("alice".into()), SubscriptionScope::Full);
        reg.broadcast(&OutboundEvent::ChainMilestone {
            height: 1,
            hash: "a".into(),
        });
        assert_eq!(anon.len(), 0);
        assert_eq!(auth.len(), 1);
        reg.broadcast(&OutboundEvent::Insight(insight(1, "x")));
        assert_eq!(anon.len(), 1);
        assert_eq!(auth.len(), 2);
    }

    #[test]
    fn anonymous_connect_replays_recent_window() {
        let reg = registry();
        for i in 1..=7i64 {
            reg.broadcast(&OutboundEvent::Insight(insight(i, "old")));
        }
        // recent_cap is 5: a late anonymous subscriber sees the last five.
        let (_, q) = reg.register(None, SubscriptionScope::RecentOnly);
        assert_eq!(q.len(), 5);
    }

    #[test]
    fn missed_heartbeats_force_unregister() {
        let reg = ConnectionRegistry::new(8, 5, Duration::from_millis(20));
        let (id, _q) = reg.register(None, SubscriptionScope::Full);
        let (live_id, _q2) = reg.register(None, SubscriptionScope::Full);
        std::thread::sleep(Duration::from_millis(40));
        reg.record_heartbeat(live_id);
        // live_id just beat; id is stale.
        let swept = reg.sweep_stale();
        assert_eq!(swept, vec![id]);
        assert_eq!(reg.connection_count(), 1);
        assert!(!reg.record_heartbeat(id));
    }

    #[test]
    fn seeded_recent_window_replays_to_anonymous_connects() {
        let reg = registry();
        reg.seed_recent((1..=7i64).map(|i| insight(i, "restored")));
        let (_, q) = reg.register(None, SubscriptionScope::RecentOnly);
        assert_eq!(q.len(), 5);
    }

    #[tokio::test]
    async fn sweep_closes_queues_so_drains_terminate() {
        let reg = ConnectionRegistry::new(8, 5, Duration::from_millis(20));
        let (_, q) = reg.register(None, SubscriptionScope::Full);
        reg.broadcast(&OutboundEvent::ChainMilestone {
            height: 1,
            hash: "a".into(),
        });
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(reg.sweep_stale().len(), 1);

        // A drain parked on a swept queue must wake up and see the end,
        // not wait forever for events nobody will push.
        let ended = tokio::time::timeout(Duration::from_millis(100), q.next()).await;
        assert!(ended.expect("drain still parked").is_none());
    }

    #[tokio::test]
    async fn unregister_closes_the_queue() {
        let reg = registry();
        let (id, q) = reg.register(None, SubscriptionScope::Full);
        reg.unregister(id);
        assert!(q.next().await.is_none());
    }

    #[test]
    fn unregister_is_idempotent() {
        let reg = registry();
        let (id, _) = reg.register(None, SubscriptionScope::Full);
        assert!(reg.unregister(id));
        assert!(!reg.unregister(id));
    }
}
