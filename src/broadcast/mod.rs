//! Event Broadcaster Module
//!
//! Decouples writers (the backend change feed) from index maintainers.
//! The broadcaster delivers every event to every current subscriber without
//! ever blocking the publisher: a subscriber that falls behind the channel
//! capacity observes an explicit lag notification and is expected to fall
//! back to a full rebuild instead of stalling ingestion.

use tokio::sync::broadcast;

#[cfg(test)]
mod tests;

/// Default channel capacity. Small enough that a stuck subscriber lags
/// quickly instead of accumulating unbounded memory.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out dispatcher for write events.
pub struct Broadcaster<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to all current subscribers. Never blocks; returns
    /// the number of subscribers the event was delivered to (0 when nobody
    /// is listening, which is not an error).
    pub fn publish(&self, event: T) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> EventStream<T> {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// One subscriber's view of the event flow.
pub struct EventStream<T> {
    rx: broadcast::Receiver<T>,
}

/// Outcome of waiting for the next event.
#[derive(Debug)]
pub enum EventDelivery<T> {
    /// The next event, in publish order.
    Event(T),
    /// The subscriber fell behind and `missed` events were dropped. The
    /// stream remains usable; the consumer decides how to recover.
    Lagged { missed: u64 },
    /// The broadcaster was dropped; no further events will arrive.
    Closed,
}

impl<T: Clone + Send + 'static> EventStream<T> {
    pub async fn recv(&mut self) -> EventDelivery<T> {
        match self.rx.recv().await {
            Ok(event) => EventDelivery::Event(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => EventDelivery::Lagged { missed },
            Err(broadcast::error::RecvError::Closed) => EventDelivery::Closed,
        }
    }
}
