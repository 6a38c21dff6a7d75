//! Event fan-out for transport faults and telemetry.
//!
//! Publishing never blocks the core: events go into a bounded broadcast
//! channel, and a subscriber that falls behind loses the oldest events
//! instead of holding up the read loop or a poll job.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::poll::{TelemetryKind, TelemetryRecord};
use crate::registry::PortId;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Notifications emitted by the core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// A session's read loop died; the port must be closed and reopened.
    TransportError {
        port_id: PortId,
        message: String,
        at: DateTime<Utc>,
    },
    /// A poll job read and parsed a telemetry region.
    Telemetry {
        port_id: PortId,
        device_id: u8,
        kind: TelemetryKind,
        record: TelemetryRecord,
        at: DateTime<Utc>,
    },
}

impl HubEvent {
    pub fn transport_error(port_id: PortId, message: impl Into<String>) -> Self {
        Self::TransportError {
            port_id,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn telemetry(port_id: PortId, device_id: u8, record: TelemetryRecord) -> Self {
        Self::Telemetry {
            port_id,
            device_id,
            kind: record.kind(),
            record,
            at: Utc::now(),
        }
    }

    pub fn port_id(&self) -> PortId {
        match self {
            Self::TransportError { port_id, .. } | Self::Telemetry { port_id, .. } => *port_id,
        }
    }
}

/// Error type sinks may return; it is logged and otherwise ignored.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// A callback-style subscriber.
pub trait EventSink: Send + Sync + 'static {
    fn handle(&self, event: &HubEvent) -> Result<(), SinkError>;
}

impl<F> EventSink for F
where
    F: Fn(&HubEvent) -> Result<(), SinkError> + Send + Sync + 'static,
{
    fn handle(&self, event: &HubEvent) -> Result<(), SinkError> {
        self(event)
    }
}

/// Cloneable handle to the shared event channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget delivery. Events published with no subscriber are dropped.
    pub fn publish(&self, event: HubEvent) {
        if self.tx.send(event).is_err() {
            debug!("event dropped, no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Forward events to `sink` on a dedicated task.
    ///
    /// The subscription is taken before this returns. Errors and panics
    /// raised by the sink are logged and the task keeps going; dropping or
    /// aborting the returned handle unregisters the sink.
    pub fn register<S: EventSink>(&self, sink: S) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        let sink = Arc::new(sink);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => deliver(sink.as_ref(), &event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("event sink lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

fn deliver<S: EventSink>(sink: &S, event: &HubEvent) {
    match catch_unwind(AssertUnwindSafe(|| sink.handle(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(port_id = %event.port_id(), "event sink failed: {}", e),
        Err(_) => error!(port_id = %event.port_id(), "event sink panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        bus.publish(HubEvent::transport_error(PortId::new(), "nobody listening"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        let id = PortId::new();
        for i in 0..5 {
            bus.publish(HubEvent::transport_error(id, format!("event {i}")));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        match rx.recv().await.unwrap() {
            HubEvent::TransportError { message, .. } => assert_eq!(message, "event 3"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_delivery() {
        let bus = EventBus::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_sink = Arc::clone(&seen);
        let calls = Arc::new(Mutex::new(0u32));
        let calls_by_sink = Arc::clone(&calls);

        let _task = bus.register(move |event: &HubEvent| -> Result<(), SinkError> {
            let mut calls = calls_by_sink.lock();
            *calls += 1;
            match *calls {
                1 => Err("first delivery rejected".into()),
                2 => panic!("second delivery blows up"),
                _ => {
                    seen_by_sink.lock().push(event.port_id());
                    Ok(())
                }
            }
        });

        let id = PortId::new();
        for _ in 0..3 {
            bus.publish(HubEvent::transport_error(id, "x"));
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*seen.lock(), vec![id]);
    }

    #[test]
    fn test_event_serialization() {
        let id = PortId::new();
        let json = serde_json::to_value(HubEvent::transport_error(id, "boom")).unwrap();
        assert_eq!(json["type"], "transport_error");
        assert_eq!(json["port_id"], id.to_string());
        assert_eq!(json["message"], "boom");
    }
}
