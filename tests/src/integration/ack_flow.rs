//! # Acknowledgement Flow
//!
//! The delivery callback hands each batch to a client and waits for the
//! client's ack before the subscription cursor moves on. A client that
//! never answers fails the subscription once the ack threshold passes.

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use relay_bus::{
        AckConfig, AckError, AckHandler, BasicSubscriber, Cursor, DeliveryError,
        InMemoryMessageBus, MessageBatch, MessagePublisher,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Per-connection state shared with the delivery callback.
    struct Connection {
        acks: Arc<AckHandler>,
        outbound: mpsc::UnboundedSender<(String, MessageBatch)>,
    }

    async fn send_and_wait(
        batch: MessageBatch,
        connection: Arc<Connection>,
    ) -> Result<bool, DeliveryError> {
        if batch.terminal {
            return Ok(true);
        }
        let ack_id = format!("ack-{}", batch.cursor);
        let pending = connection.acks.create_ack(ack_id.clone());
        let _ = connection.outbound.send((ack_id, batch));
        pending.await.map_err(DeliveryError::callback)?;
        Ok(true)
    }

    #[tokio::test]
    async fn test_cursor_advances_only_after_client_ack() {
        let bus = InMemoryMessageBus::with_defaults();
        let acks = AckHandler::new(AckConfig::default());
        let (outbound, mut client) = mpsc::unbounded_channel();

        let handle = bus
            .subscribe(
                &BasicSubscriber::new("conn-1", ["chat"]),
                None,
                send_and_wait,
                10,
                Connection {
                    acks: acks.clone(),
                    outbound,
                },
            )
            .unwrap();

        bus.publish("hub", "chat", Bytes::from_static(b"hello")).await.unwrap();

        let (ack_id, batch) = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert!(acks.is_pending(&ack_id));

        let before: Cursor = handle.cursor().parse().unwrap();
        assert_eq!(before.offset("chat"), Some(0));

        assert!(acks.trigger_ack(&ack_id));

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let cursor: Cursor = handle.cursor().parse().unwrap();
                if cursor.offset("chat") == Some(1) {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("cursor never advanced");

        assert!(!acks.trigger_ack(&ack_id));
        assert_eq!(acks.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ack_fails_subscription() {
        let bus = InMemoryMessageBus::with_defaults();
        let acks = AckHandler::new(AckConfig {
            ack_threshold: Duration::from_secs(2),
            ack_interval: Duration::from_millis(500),
            complete_acks_on_timeout: true,
        });
        let (outbound, mut client) = mpsc::unbounded_channel();

        let handle = bus
            .subscribe(
                &BasicSubscriber::new("conn-1", ["chat"]),
                None,
                send_and_wait,
                10,
                Connection {
                    acks: acks.clone(),
                    outbound,
                },
            )
            .unwrap();

        bus.publish("hub", "chat", Bytes::from_static(b"hello")).await.unwrap();
        let (ack_id, _batch) = client.recv().await.unwrap();

        let result = handle.completion().await;
        let Err(DeliveryError::Callback(error)) = result else {
            panic!("expected callback failure, got {result:?}");
        };
        assert_eq!(
            error.downcast_ref::<AckError>(),
            Some(&AckError::TimedOut {
                id: ack_id,
                threshold_ms: 2000
            })
        );
        assert!(handle.is_disposed());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
