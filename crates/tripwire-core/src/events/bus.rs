//! Event bus using tokio broadcast channel
//!
//! Event sources publish here. Broadcast subscribers are lossy: slow ones
//! miss events rather than blocking senders. Consumers that must see every
//! event (the automation engine) attach an [`EventSink`] instead, which is
//! called synchronously from [`EventBus::emit`].

use crate::events::AutomationEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Default channel capacity
pub const DEFAULT_CAPACITY: usize = 1024;

/// Lossless consumer of bus events.
pub trait EventSink: Send + Sync {
    /// Deliver an event. Returning `false` detaches the sink.
    ///
    /// Called with the bus's sink list locked, so it must not emit on the
    /// same bus.
    fn deliver(&self, event: &AutomationEvent) -> bool;
}

/// Handle returned by [`EventBus::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkId(u64);

type Sinks = Vec<(SinkId, Arc<dyn EventSink>)>;

/// Event bus for automation events
///
/// Events are fire-and-forget; if no subscribers are listening, they are
/// simply dropped.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AutomationEvent>,
    sinks: Arc<Mutex<Sinks>>,
    next_sink: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sinks: Arc::new(Mutex::new(Vec::new())),
            next_sink: Arc::new(AtomicU64::new(0)),
        }
    }

    fn sinks(&self) -> MutexGuard<'_, Sinks> {
        // A panicking sink cannot leave the list half-updated
        self.sinks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a sink that receives every event emitted after this call.
    pub fn attach(&self, sink: Arc<dyn EventSink>) -> SinkId {
        let id = SinkId(self.next_sink.fetch_add(1, Ordering::Relaxed));
        self.sinks().push((id, sink));
        id
    }

    /// Detach a sink. Unknown ids are ignored.
    pub fn detach(&self, id: SinkId) {
        self.sinks().retain(|(sink_id, _)| *sink_id != id);
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
        }
    }

    /// Emit an event to all sinks, then to all subscribers
    pub fn emit(&self, event: AutomationEvent) {
        self.sinks().retain(|(_, sink)| sink.deliver(&event));
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the number of attached sinks
    pub fn sink_count(&self) -> usize {
        self.sinks().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber to event bus
pub struct EventSubscriber {
    receiver: broadcast::Receiver<AutomationEvent>,
}

impl EventSubscriber {
    /// Receive the next event
    ///
    /// Returns None once the bus is dropped. Lag is logged and skipped.
    pub async fn recv(&mut self) -> Option<AutomationEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Automation event subscriber lagged");
                    continue;
                }
            }
        }
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Option<AutomationEvent> {
        self.receiver.try_recv().ok()
    }
}
