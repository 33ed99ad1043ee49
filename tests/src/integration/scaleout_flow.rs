//! # Scale-out Flow
//!
//! Several backend processes agree on one ordering through mapping ids
//! handed out by an external sequencer. Each process ingests the mappings
//! with `receive_scaleout` and its subscribers resume by mapping id.

#[cfg(test)]
mod tests {
    use super::super::{forward_to, recv_batch};
    use bytes::Bytes;
    use relay_bus::{
        BasicSubscriber, BusConfig, BusError, Cursor, InMemoryMessageBus, MessagePublisher,
    };
    use tokio::sync::mpsc;

    fn mapping(key: &str, id: u64) -> Vec<(String, String, Bytes)> {
        vec![("peer-1".to_string(), key.to_string(), Bytes::from(id.to_string()))]
    }

    fn payload_ids(messages: &[std::sync::Arc<relay_bus::Message>]) -> Vec<u64> {
        messages
            .iter()
            .map(|m| std::str::from_utf8(&m.value).unwrap().parse().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_subscribers_follow_global_order_across_topics() {
        let bus = InMemoryMessageBus::new(BusConfig::default().with_scaleout(8, 4));
        let subscriber = BasicSubscriber::new("conn-1", ["room-a", "room-b"]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = bus.subscribe(&subscriber, None, forward_to(tx), 100, ()).unwrap();

        let keys = ["room-a", "room-b", "room-c"];
        for id in 1..=12u64 {
            bus.receive_scaleout(id, mapping(keys[(id % 3) as usize], id)).unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 8 {
            let batch = recv_batch(&mut rx).await;
            assert!(batch.messages.iter().all(|m| m.key != "room-c"));
            seen.extend(payload_ids(&batch.messages));
        }

        let expected: Vec<u64> = (1..=12).filter(|id| id % 3 != 2).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_resume_after_eviction_reports_gap() {
        let bus = InMemoryMessageBus::new(BusConfig::default().with_scaleout(4, 2));
        let subscriber = BasicSubscriber::new("conn-1", ["chat"]);

        for id in 1..=40u64 {
            bus.receive_scaleout(id, mapping("chat", id)).unwrap();
        }
        let store = bus.scaleout_store().unwrap();
        assert!(store.len() <= store.capacity());
        assert!(store.min_mapping_id().unwrap() > 2);

        let saved = Cursor::Scaleout(Some(1)).to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = bus
            .subscribe(&subscriber, Some(saved.as_str()), forward_to(tx), 100, ())
            .unwrap();

        let first = recv_batch(&mut rx).await;
        assert!(first.gap);

        let mut seen = payload_ids(&first.messages);
        let mut cursor = first.cursor.clone();
        while seen.last() != Some(&40) {
            let batch = recv_batch(&mut rx).await;
            seen.extend(payload_ids(&batch.messages));
            cursor = batch.cursor.clone();
        }

        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(cursor.parse::<Cursor>().unwrap(), Cursor::Scaleout(Some(40)));
    }

    #[tokio::test]
    async fn test_local_publish_and_remote_ingest_share_one_sequence() {
        let bus = InMemoryMessageBus::new(BusConfig::default().with_scaleout(4, 4));

        bus.publish("local", "chat", Bytes::from_static(b"a")).await.unwrap();
        bus.receive_scaleout(10, mapping("chat", 10)).unwrap();

        let stale = bus.receive_scaleout(5, mapping("chat", 5));
        assert!(matches!(stale, Err(BusError::Store(_))));

        let store = bus.scaleout_store().unwrap();
        assert_eq!(store.max_mapping().unwrap().id, 10);
        assert_eq!(bus.topic_log("chat").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_per_topic_cursor_rejected_in_scaleout_mode() {
        let bus = InMemoryMessageBus::new(BusConfig::default().with_scaleout(4, 4));
        let subscriber = BasicSubscriber::new("conn-1", ["chat"]);
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = bus.subscribe(&subscriber, Some("chat,1"), forward_to(tx), 10, ());
        assert!(matches!(
            result,
            Err(BusError::CursorModeMismatch { scaleout: true })
        ));
    }
}
