// Event Bus Implementation - Pub/Sub for Process Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Feeds the callback notifier and any embedding runtime that wants to
// observe state changes (SSE endpoints, metrics bridges, tests).
//
// In-memory only: events are lost on restart. Durable audit lives in the
// store; the bus is a best-effort fan-out.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::events::ProcessEvent;

/// Event bus for publishing and subscribing to process events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<ProcessEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity.
    /// Capacity determines how many events can be buffered before dropping old ones.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish a process event to all subscribers
    pub fn publish(&self, event: ProcessEvent) {
        debug!(event_name = %event.name(), entity_id = %event.entity_id(), "Publishing event");

        // send() returns the number of receivers that received the message
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all process events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Receiver for process events
pub struct EventReceiver {
    receiver: broadcast::Receiver<ProcessEvent>,
}

impl EventReceiver {
    /// Receive the next event (blocks until an event is available)
    pub async fn recv(&mut self) -> Result<ProcessEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<ProcessEvent, EventBusError> {
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
