// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Handshake Events
//
// In-memory event streaming using tokio broadcast channels. The ledger is the
// system of record; the bus only feeds live observers (operator consoles,
// tests waiting on a cycle).

use crate::domain::events::HandshakeEvent;
use crate::domain::packet::TraceId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to handshake events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<HandshakeEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish(&self, event: HandshakeEvent) {
        debug!(trace_id = %event.trace_id(), "Publishing event: {:?}", event);

        // send() fails only when nobody is subscribed
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all handshake events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the events of a single cycle
    pub fn subscribe_trace(&self, trace_id: TraceId) -> TraceEventReceiver {
        TraceEventReceiver {
            receiver: self.sender.subscribe(),
            trace_id,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all handshake events
pub struct EventReceiver {
    receiver: broadcast::Receiver<HandshakeEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<HandshakeEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<HandshakeEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one trace id
pub struct TraceEventReceiver {
    receiver: broadcast::Receiver<HandshakeEvent>,
    trace_id: TraceId,
}

impl TraceEventReceiver {
    pub async fn recv(&mut self) -> Result<HandshakeEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.trace_id() == self.trace_id {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::packet::CycleId;
    use chrono::Utc;

    fn started(trace_id: TraceId) -> HandshakeEvent {
        HandshakeEvent::CycleStarted {
            trace_id,
            cycle_id: CycleId::new(),
            goal: "test".to_string(),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();
        let trace_id = TraceId::new();

        event_bus.publish(started(trace_id));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.trace_id(), trace_id);
    }

    #[tokio::test]
    async fn test_trace_event_filtering() {
        let event_bus = EventBus::new(10);
        let trace_id = TraceId::new();
        let mut receiver = event_bus.subscribe_trace(trace_id);

        // Different trace, filtered out
        event_bus.publish(started(TraceId::new()));
        event_bus.publish(started(trace_id));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.trace_id(), trace_id);
    }

    #[test]
    fn test_try_recv_empty() {
        let event_bus = EventBus::default();
        let mut receiver = event_bus.subscribe();
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
        assert_eq!(event_bus.subscriber_count(), 1);
    }
}
