//! # Delivery Flow
//!
//! A connection subscribes, receives batches, disconnects and later resumes
//! from the cursor of the last batch it wrote out.

#[cfg(test)]
mod tests {
    use super::super::{forward_to, recv_batch};
    use bytes::Bytes;
    use relay_bus::{
        BasicSubscriber, BusConfig, Cursor, InMemoryMessageBus, MessageBatch, MessagePublisher,
    };
    use tokio::sync::mpsc;

    fn payloads(batch: &MessageBatch) -> Vec<Bytes> {
        batch.messages.iter().map(|m| m.value.clone()).collect()
    }

    #[tokio::test]
    async fn test_reconnect_resumes_after_last_batch() {
        let bus = InMemoryMessageBus::with_defaults();
        let subscriber = BasicSubscriber::new("conn-1", ["chat"]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = bus.subscribe(&subscriber, None, forward_to(tx), 10, ()).unwrap();

        bus.publish("hub", "chat", Bytes::from_static(b"one")).await.unwrap();
        let first = recv_batch(&mut rx).await;
        assert_eq!(payloads(&first), vec![Bytes::from_static(b"one")]);

        // Connection drops; the client keeps the cursor of the last batch.
        let saved = first.cursor.clone();
        drop(handle);
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish("hub", "chat", Bytes::from_static(b"two")).await.unwrap();
        bus.publish("hub", "chat", Bytes::from_static(b"three")).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = bus
            .subscribe(&subscriber, Some(saved.as_str()), forward_to(tx), 10, ())
            .unwrap();

        let resumed = recv_batch(&mut rx).await;
        assert!(!resumed.gap);
        assert_eq!(
            payloads(&resumed),
            vec![Bytes::from_static(b"two"), Bytes::from_static(b"three")]
        );
        let cursor: Cursor = resumed.cursor.parse().unwrap();
        assert_eq!(cursor.offset("chat"), Some(3));
    }

    #[tokio::test]
    async fn test_resume_behind_retention_reports_gap() {
        let bus = InMemoryMessageBus::new(BusConfig::default().with_topic_capacity(4));
        let subscriber = BasicSubscriber::new("conn-1", ["chat"]);

        bus.publish("hub", "chat", Bytes::from_static(b"0")).await.unwrap();
        for i in 1..10u8 {
            bus.publish("hub", "chat", Bytes::from(vec![i])).await.unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = bus
            .subscribe(&subscriber, Some("chat,1"), forward_to(tx), 10, ())
            .unwrap();

        let batch = recv_batch(&mut rx).await;
        assert!(batch.gap);
        let ids: Vec<u64> = batch.messages.iter().map(|m| m.local_id).collect();
        assert_eq!(ids, vec![6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_multi_topic_subscriber_sees_each_topic_in_order() {
        let bus = InMemoryMessageBus::with_defaults();
        let subscriber = BasicSubscriber::new("conn-1", ["room-a", "room-b"]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = bus.subscribe(&subscriber, None, forward_to(tx), 100, ()).unwrap();

        for i in 0..5u8 {
            bus.publish("hub", "room-a", Bytes::from(vec![i])).await.unwrap();
            bus.publish("hub", "room-b", Bytes::from(vec![i])).await.unwrap();
            bus.publish("hub", "room-c", Bytes::from(vec![i])).await.unwrap();
        }

        let mut per_topic: std::collections::BTreeMap<String, Vec<u64>> = Default::default();
        while per_topic.values().map(Vec::len).sum::<usize>() < 10 {
            let batch = recv_batch(&mut rx).await;
            for message in &batch.messages {
                per_topic
                    .entry(message.key.clone())
                    .or_default()
                    .push(message.local_id);
            }
        }

        assert!(!per_topic.contains_key("room-c"));
        assert_eq!(per_topic["room-a"], vec![0, 1, 2, 3, 4]);
        assert_eq!(per_topic["room-b"], vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_joining_a_group_mid_stream() {
        let bus = InMemoryMessageBus::with_defaults();
        let subscriber = BasicSubscriber::new("conn-1", ["chat"]);

        bus.publish("hub", "group-1", Bytes::from_static(b"before")).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = bus.subscribe(&subscriber, None, forward_to(tx), 10, ()).unwrap();
        assert!(handle.add_event_key("group-1"));

        bus.publish("hub", "group-1", Bytes::from_static(b"after")).await.unwrap();

        let batch = recv_batch(&mut rx).await;
        assert_eq!(payloads(&batch), vec![Bytes::from_static(b"after")]);

        let cursor: Cursor = batch.cursor.parse().unwrap();
        assert_eq!(cursor.offset("group-1"), Some(2));
        assert_eq!(cursor.offset("chat"), Some(0));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_terminal_batch() {
        let bus = InMemoryMessageBus::with_defaults();
        let subscriber = BasicSubscriber::new("conn-1", ["chat"]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = bus.subscribe(&subscriber, None, forward_to(tx), 10, ()).unwrap();

        bus.shutdown();

        let batch = recv_batch(&mut rx).await;
        assert!(batch.terminal);
        assert!(handle.completion().await.is_ok());
        assert!(bus.is_shut_down());
    }
}
