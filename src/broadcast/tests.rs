//! Broadcaster Tests
//!
//! ## Test Scopes
//! - **Fan-out**: All subscribers see all events in publish order.
//! - **Lag semantics**: A slow subscriber observes `Lagged` instead of
//!   blocking the publisher.
//! - **Lifecycle**: Publishing without subscribers is a no-op, not an error.

#[cfg(test)]
mod tests {
    use crate::broadcast::{Broadcaster, EventDelivery};

    #[tokio::test]
    async fn test_all_subscribers_receive_in_order() {
        // ARRANGE
        let broadcaster: Broadcaster<u32> = Broadcaster::new(16);
        let mut s1 = broadcaster.subscribe();
        let mut s2 = broadcaster.subscribe();

        // ACT
        broadcaster.publish(1);
        broadcaster.publish(2);
        broadcaster.publish(3);

        // ASSERT
        for stream in [&mut s1, &mut s2] {
            for expected in 1..=3 {
                match stream.recv().await {
                    EventDelivery::Event(v) => assert_eq!(v, expected),
                    other => panic!("unexpected delivery: {:?}", other),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let broadcaster: Broadcaster<u32> = Broadcaster::new(4);
        assert_eq!(broadcaster.publish(42), 0);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_observes_lag() {
        // ARRANGE: capacity 4, subscriber never drains while we publish 10
        let broadcaster: Broadcaster<u32> = Broadcaster::new(4);
        let mut slow = broadcaster.subscribe();

        // ACT: publisher is never blocked by the stuck subscriber
        for i in 0..10 {
            broadcaster.publish(i);
        }

        // ASSERT: the first recv reports the miss count
        match slow.recv().await {
            EventDelivery::Lagged { missed } => assert_eq!(missed, 6),
            other => panic!("expected lag, got {:?}", other),
        }

        // The stream stays usable from the oldest retained event
        match slow.recv().await {
            EventDelivery::Event(v) => assert_eq!(v, 6),
            other => panic!("unexpected delivery: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_when_broadcaster_dropped() {
        let broadcaster: Broadcaster<u32> = Broadcaster::new(4);
        let mut stream = broadcaster.subscribe();
        broadcaster.publish(7);
        drop(broadcaster);

        match stream.recv().await {
            EventDelivery::Event(7) => {}
            other => panic!("unexpected delivery: {:?}", other),
        }
        match stream.recv().await {
            EventDelivery::Closed => {}
            other => panic!("expected closed, got {:?}", other),
        }
    }
}
