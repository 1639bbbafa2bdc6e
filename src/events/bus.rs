//! Tokio broadcast event bus for post-commit notifications.

use crate::models::{EventType, KernelEvent};
use tokio::sync::broadcast;

/// Default broadcast buffer size.
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 1024;

/// In-process publish hook for committed kernel events.
///
/// Delivery is best effort: a receiver that falls more than the buffer
/// capacity behind skips the oldest events and is told how many it missed.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<KernelEvent>,
}

/// Receiver that yields only events matching a predicate.
pub struct FilteredReceiver<F> {
    receiver: broadcast::Receiver<KernelEvent>,
    predicate: F,
}

impl EventBus {
    /// Creates a bus with the given buffer capacity (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all current subscribers.
    #[allow(clippy::cast_precision_loss)]
    pub fn publish(&self, event: KernelEvent) {
        metrics::counter!("event_bus_publish_total", "type" => event.type_name()).increment(1);
        metrics::gauge!("event_bus_receivers").set(self.sender.receiver_count() as f64);
        match self.sender.send(event) {
            Ok(_) => {
                metrics::gauge!("event_bus_queue_depth").set(self.sender.len() as f64);
            },
            Err(_) => {
                // No live receivers; the event is still in the persisted log.
                metrics::counter!("event_bus_publish_unobserved_total").increment(1);
            },
        }
    }

    /// Subscribes to every event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        metrics::counter!("event_bus_subscriptions_total").increment(1);
        self.sender.subscribe()
    }

    /// Subscribes with a predicate over events.
    #[must_use]
    pub fn subscribe_filtered<F>(&self, predicate: F) -> FilteredReceiver<F>
    where
        F: Fn(&KernelEvent) -> bool,
    {
        FilteredReceiver {
            receiver: self.subscribe(),
            predicate,
        }
    }

    /// Subscribes to a single event type.
    #[must_use]
    pub fn subscribe_event_type(
        &self,
        event_type: EventType,
    ) -> FilteredReceiver<impl Fn(&KernelEvent) -> bool + use<>> {
        self.subscribe_filtered(move |event: &KernelEvent| event.event_type == event_type)
    }

    /// Number of live receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUS_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&KernelEvent) -> bool,
{
    /// Receives the next matching event.
    ///
    /// Lag is logged and skipped; `Err` is returned only once the bus is
    /// closed.
    pub async fn recv(&mut self) -> Result<KernelEvent, broadcast::error::RecvError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if (self.predicate)(&event) {
                        return Ok(event);
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event bus receiver lagged; events were dropped");
                    metrics::counter!("event_bus_lagged_total").increment(skipped);
                },
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns the next matching event already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<KernelEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if (self.predicate)(&event) => return Some(event),
                Ok(_) => {},
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    metrics::counter!("event_bus_lagged_total").increment(skipped);
                },
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: EventType) -> KernelEvent {
        KernelEvent::new(event_type, "test", json!({}), 1, 0)
    }

    #[tokio::test]
    async fn test_subscribe_event_type_skips_non_matching() {
        let bus = EventBus::new(16);
        let mut filtered = bus.subscribe_event_type(EventType::ConsensusReached);

        bus.publish(event(EventType::VoteCast));
        bus.publish(event(EventType::ConsensusReached));

        let received = filtered.recv().await.expect("receive event");
        assert_eq!(received.event_type, EventType::ConsensusReached);
    }

    #[tokio::test]
    async fn test_lagged_receiver_recovers() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe_filtered(|_: &KernelEvent| true);
        for _ in 0..5 {
            bus.publish(event(EventType::EntryStored));
        }
        bus.publish(event(EventType::HintPosted));

        let mut last = None;
        while let Some(e) = rx.try_recv() {
            last = Some(e.event_type);
        }
        assert_eq!(last, Some(EventType::HintPosted));
    }

    #[test]
    fn test_publish_without_receivers_is_ok() {
        let bus = EventBus::default();
        bus.publish(event(EventType::EntrySwept));
        assert_eq!(bus.receiver_count(), 0);
    }
}
