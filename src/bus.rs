//! In-process fan-out of alert and progress events.
//!
//! Single producer, any number of subscribers. Every subscriber has a
//! bounded mailbox; when a slow subscriber falls behind, the oldest
//! messages are dropped and counted instead of ever blocking the replay
//! driver. Ordering is FIFO per subscriber only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::AlertRecord;

/// Default per-subscriber mailbox capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// Messages delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusEvent {
    /// A persisted alert
    Alert { data: AlertRecord },
    /// Cumulative processed-point count for the active session
    Tick { processed: u64 },
    /// Terminal session failure
    Error { message: String },
}

/// Cloneable handle for publishing events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish to all current subscribers. Never blocks; with no
    /// subscribers the event is simply discarded.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            dropped: self.dropped.clone(),
        }
    }

    /// Messages dropped across all subscribers because a mailbox was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// One subscriber's view of the bus.
pub struct EventStream {
    rx: broadcast::Receiver<BusEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    /// Receive the next event. Overflowed messages are counted and skipped;
    /// `None` means the bus itself is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.dropped.fetch_add(missed, Ordering::Relaxed);
                    debug!("subscriber lagged, dropped {missed} oldest messages");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive, for drain loops.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    self.dropped.fetch_add(missed, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order() {
        let bus = EventBus::new(8);
        let mut stream = bus.subscribe();
        for i in 0..5 {
            bus.publish(BusEvent::Tick { processed: i });
        }
        for i in 0..5 {
            match stream.recv().await {
                Some(BusEvent::Tick { processed }) => assert_eq!(processed, i),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let bus = EventBus::new(4);
        let mut stream = bus.subscribe();
        for i in 0..10 {
            bus.publish(BusEvent::Tick { processed: i });
        }
        // The four newest survive; the six oldest were dropped.
        let first = stream.recv().await.unwrap();
        match first {
            BusEvent::Tick { processed } => assert_eq!(processed, 6),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(bus.dropped_count(), 6);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(BusEvent::Error {
            message: "nobody listening".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn events_serialize_with_kind_tags() {
        let tick = serde_json::to_value(BusEvent::Tick { processed: 42 }).unwrap();
        assert_eq!(tick["kind"], "tick");
        assert_eq!(tick["processed"], 42);

        let error = serde_json::to_value(BusEvent::Error {
            message: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(error["kind"], "error");
    }
}
