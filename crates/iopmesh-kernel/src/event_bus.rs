//! Event bus — broadcast of engine events with a history ring buffer.

use chrono::{DateTime, Utc};
use iopmesh_types::event::EngineEvent;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// An engine event stamped by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Position in the bus order, starting at 1.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: EngineEvent,
}

/// Fan-out of engine events to any number of subscribers.
pub struct EventBus {
    sender: broadcast::Sender<EventRecord>,
    history: Arc<RwLock<VecDeque<EventRecord>>>,
    capacity: usize,
    next_seq: AtomicU64,
}

impl EventBus {
    /// Create a bus retaining at most `capacity` events of history.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            history: Arc::new(RwLock::new(VecDeque::with_capacity(capacity.min(4096)))),
            capacity,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Publish an event to the bus.
    pub async fn publish(&self, event: EngineEvent) {
        let record = EventRecord {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            event,
        };
        debug!(seq = record.seq, event = record.event.kind(), "Publishing event");

        if self.capacity > 0 {
            let mut history = self.history.write().await;
            if history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back(record.clone());
        }

        // No subscribers is not an error.
        let _ = self.sender.send(record);
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    /// The most recent `limit` events, oldest first.
    pub async fn history(&self, limit: usize) -> Vec<EventRecord> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iopmesh_types::event::QuotaKind;
    use iopmesh_types::peer::PeerId;

    fn purged(id: &str) -> EngineEvent {
        EngineEvent::PeerPurged {
            peer_id: PeerId::from(id),
        }
    }

    #[tokio::test]
    async fn test_publish_and_history() {
        let bus = EventBus::new(10);
        bus.publish(purged("a")).await;
        bus.publish(purged("b")).await;

        let history = bus.history(10).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].seq, 1);
        assert_eq!(history[1].event, purged("b"));
    }

    #[test]
    fn test_history_ring_buffer() {
        let bus = EventBus::new(3);
        tokio_test::block_on(async {
            for i in 0..5 {
                bus.publish(purged(&format!("p{i}"))).await;
            }
            let history = bus.history(10).await;
            assert_eq!(history.len(), 3);
            assert_eq!(history[0].event, purged("p2"));
            assert_eq!(bus.history(1).await[0].event, purged("p4"));
        });
    }

    #[tokio::test]
    async fn test_subscribe() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::QuotaExceeded {
            kind: QuotaKind::Timeout,
        })
        .await;

        let received = rx.recv().await.unwrap();
        match received.event {
            EngineEvent::QuotaExceeded { kind } => assert_eq!(kind, QuotaKind::Timeout),
            other => panic!("Wrong event: {other:?}"),
        }
    }
}
