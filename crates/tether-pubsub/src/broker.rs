//! Broker handle and bucket delivery workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use tether_shard::shard_index;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::PubSubConfig;
use crate::errors::{PubSubError, Result};
use crate::subscriber::{Handler, Subscriber, TopicTable};

/// A payload on its way to the subscribers of one topic.
struct Delivery {
    topic: String,
    payload: Bytes,
}

struct Inner {
    table: Arc<TopicTable>,
    buckets: Vec<mpsc::Sender<Delivery>>,
    next_subscriber: AtomicU64,
}

/// Process-wide pub/sub broker.
///
/// Cheap to clone. The bucket workers stop once every clone is dropped.
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct PubSub {
    inner: Arc<Inner>,
}

impl PubSub {
    /// Create a broker and spawn one delivery worker per bucket.
    pub fn new(config: PubSubConfig) -> Self {
        let config = config.normalized();
        let table: Arc<TopicTable> = Arc::new(DashMap::new());
        let buckets = (0..config.buckets)
            .map(|index| {
                let (tx, rx) = mpsc::channel(config.bucket_buffer);
                drop(tokio::spawn(run_bucket(index, rx, table.clone())));
                tx
            })
            .collect();
        debug!(
            buckets = config.buckets,
            bucket_buffer = config.bucket_buffer,
            "pub/sub broker started"
        );
        Self {
            inner: Arc::new(Inner {
                table,
                buckets,
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// Create a new subscriber identity.
    pub fn subscriber(&self) -> Subscriber {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        Subscriber::new(id, self.inner.table.clone())
    }

    /// Publish `payload` to every subscriber of `topic`.
    ///
    /// Never waits: fails with [`PubSubError::BucketFull`] when the topic's
    /// bucket is saturated. Publishing to a topic nobody listens on succeeds
    /// and does nothing.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        if !self.inner.table.contains_key(topic) {
            trace!(topic, "publish to topic without subscribers");
            return Ok(());
        }
        let bucket = &self.inner.buckets[shard_index(topic, self.inner.buckets.len())];
        let delivery = Delivery {
            topic: topic.to_owned(),
            payload: payload.into(),
        };
        match bucket.try_send(delivery) {
            Ok(()) => {
                counter!("tether_pubsub_published_total").increment(1);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!("tether_pubsub_dropped_total").increment(1);
                warn!(topic, "pub/sub bucket full, dropping payload");
                Err(PubSubError::BucketFull {
                    topic: topic.to_owned(),
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PubSubError::Closed),
        }
    }

    /// Number of subscribers listening on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.table.get(topic).map_or(0, |subs| subs.len())
    }

    /// Topics with at least one subscriber.
    pub fn topics(&self) -> Vec<String> {
        self.inner
            .table
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new(PubSubConfig::default())
    }
}

/// Drain one bucket, invoking handlers outside the table lock.
async fn run_bucket(index: usize, mut rx: mpsc::Receiver<Delivery>, table: Arc<TopicTable>) {
    while let Some(delivery) = rx.recv().await {
        let handlers: Vec<Handler> = match table.get(&delivery.topic) {
            Some(subs) => subs.values().cloned().collect(),
            None => continue,
        };
        trace!(
            bucket = index,
            topic = %delivery.topic,
            subscribers = handlers.len(),
            "delivering"
        );
        for handler in handlers {
            handler(delivery.payload.clone());
        }
    }
    debug!(bucket = index, "pub/sub bucket stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn collecting(sub: &Subscriber, topic: &str) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        sub.subscribe(topic, move |payload| {
            let _ = tx.send(payload);
        })
        .unwrap();
        rx
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let broker = PubSub::default();
        let sub = broker.subscriber();
        let mut rx = collecting(&sub, "news");

        broker.publish("news", "hello").unwrap();

        let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&got[..], b"hello");
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let broker = PubSub::default();
        let one = broker.subscriber();
        let two = broker.subscriber();
        let mut rx1 = collecting(&one, "t");
        let mut rx2 = collecting(&two, "t");

        broker.publish("t", Bytes::from_static(b"x")).unwrap();

        assert!(timeout(WAIT, rx1.recv()).await.unwrap().is_some());
        assert!(timeout(WAIT, rx2.recv()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn payloads_arrive_in_publish_order() {
        let broker = PubSub::default();
        let sub = broker.subscriber();
        let mut rx = collecting(&sub, "seq");

        for i in 0..20 {
            broker.publish("seq", format!("{i}")).unwrap();
        }
        for i in 0..20 {
            let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(got, Bytes::from(format!("{i}")));
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let broker = PubSub::default();
        assert!(broker.publish("nobody", "x").is_ok());
    }

    #[tokio::test]
    async fn unsubscribed_handler_not_called() {
        let broker = PubSub::default();
        let sub = broker.subscriber();
        let other = broker.subscriber();
        let mut rx = collecting(&sub, "t");
        let mut other_rx = collecting(&other, "t");

        assert!(sub.unsubscribe("t"));
        broker.publish("t", "x").unwrap();

        assert!(timeout(WAIT, other_rx.recv()).await.unwrap().is_some());
        // The handler (and its sender) were dropped on unsubscribe.
        assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn subscriber_count_and_topics() {
        let broker = PubSub::default();
        let a = broker.subscriber();
        let b = broker.subscriber();
        a.subscribe("x", |_| {}).unwrap();
        b.subscribe("x", |_| {}).unwrap();
        b.subscribe("y", |_| {}).unwrap();

        assert_eq!(broker.subscriber_count("x"), 2);
        assert_eq!(broker.subscriber_count("y"), 1);
        assert_eq!(broker.subscriber_count("z"), 0);

        let mut topics = broker.topics();
        topics.sort();
        assert_eq!(topics, vec!["x".to_string(), "y".to_string()]);

        b.unsubscribe_all();
        assert_eq!(broker.topics(), vec!["x".to_string()]);
        drop(a);
        assert!(broker.topics().is_empty());
    }

    #[tokio::test]
    async fn closed_subscriber_gets_no_deliveries() {
        let broker = PubSub::default();
        let sub = broker.subscriber();
        sub.close();
        assert!(sub.subscribe("t", |_| {}).is_err());
        assert_eq!(broker.subscriber_count("t"), 0);
        assert!(broker.topics().is_empty());
    }

    #[tokio::test]
    async fn subscriber_ids_are_unique() {
        let broker = PubSub::default();
        let a = broker.subscriber();
        let b = broker.subscriber();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn full_bucket_rejects_publish() {
        // Current-thread runtime: the worker cannot drain until we yield.
        let broker = PubSub::new(PubSubConfig {
            buckets: 1,
            bucket_buffer: 1,
        });
        let sub = broker.subscriber();
        sub.subscribe("t", |_| {}).unwrap();

        assert!(broker.publish("t", "first").is_ok());
        let err = broker.publish("t", "second").unwrap_err();
        assert_eq!(
            err,
            PubSubError::BucketFull {
                topic: "t".into()
            }
        );
    }
}
