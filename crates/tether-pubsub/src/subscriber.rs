//! Per-identity subscription handle.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::errors::{PubSubError, Result};

/// Callback invoked with each payload published to a subscribed topic.
pub type Handler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// topic -> subscriber id -> handler
pub(crate) type TopicTable = DashMap<String, HashMap<u64, Handler>>;

#[derive(Default)]
struct State {
    topics: HashSet<String>,
    closed: bool,
}

/// A subscriber identity and the topics it listens on.
///
/// Dropping the subscriber removes all of its subscriptions.
pub struct Subscriber {
    id: u64,
    table: Arc<TopicTable>,
    state: Mutex<State>,
}

impl Subscriber {
    pub(crate) fn new(id: u64, table: Arc<TopicTable>) -> Self {
        Self {
            id,
            table,
            state: Mutex::new(State::default()),
        }
    }

    /// Subscriber id, unique within one broker.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Listen on `topic`. Subscribing again to the same topic replaces the
    /// previous handler.
    ///
    /// Fails with [`PubSubError::SubscriberClosed`] once [`close`](Self::close)
    /// has run.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let mut state = self.state.lock();
        if state.closed {
            return Err(PubSubError::SubscriberClosed { id: self.id });
        }
        let _ = self
            .table
            .entry(topic.clone())
            .or_default()
            .insert(self.id, Arc::new(handler));
        debug!(subscriber = self.id, topic = %topic, "subscribed");
        let _ = state.topics.insert(topic);
        Ok(())
    }

    /// Stop listening on `topic`. Returns whether a subscription existed.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let mut state = self.state.lock();
        if !state.topics.remove(topic) {
            return false;
        }
        self.detach(topic);
        true
    }

    /// Drop every subscription held by this subscriber.
    pub fn unsubscribe_all(&self) {
        let mut state = self.state.lock();
        for topic in state.topics.drain() {
            self.detach(&topic);
        }
    }

    /// Drop every subscription and refuse new ones.
    ///
    /// Once this returns no handler of this subscriber is left in the topic
    /// table, even if a `subscribe` was racing with it.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for topic in state.topics.drain() {
            self.detach(&topic);
        }
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Topics this subscriber currently listens on.
    pub fn topics(&self) -> Vec<String> {
        self.state.lock().topics.iter().cloned().collect()
    }

    fn detach(&self, topic: &str) {
        if let Some(mut subscribers) = self.table.get_mut(topic) {
            let _ = subscribers.remove(&self.id);
        }
        let _ = self.table.remove_if(topic, |_, subscribers| subscribers.is_empty());
        debug!(subscriber = self.id, topic, "unsubscribed");
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("topics", &state.topics.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<TopicTable> {
        Arc::new(DashMap::new())
    }

    #[test]
    fn subscribe_registers_in_table() {
        let table = table();
        let sub = Subscriber::new(1, table.clone());
        sub.subscribe("a", |_| {}).unwrap();
        sub.subscribe("b", |_| {}).unwrap();
        assert_eq!(table.len(), 2);
        let mut topics = sub.topics();
        topics.sort();
        assert_eq!(topics, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn resubscribe_replaces_handler() {
        let table = table();
        let sub = Subscriber::new(1, table.clone());
        sub.subscribe("a", |_| {}).unwrap();
        sub.subscribe("a", |_| {}).unwrap();
        assert_eq!(table.get("a").unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_removes_empty_topic() {
        let table = table();
        let sub = Subscriber::new(1, table.clone());
        sub.subscribe("a", |_| {}).unwrap();
        assert!(sub.unsubscribe("a"));
        assert!(!sub.unsubscribe("a"));
        assert!(table.is_empty());
    }

    #[test]
    fn unsubscribe_keeps_other_subscribers() {
        let table = table();
        let one = Subscriber::new(1, table.clone());
        let two = Subscriber::new(2, table.clone());
        one.subscribe("a", |_| {}).unwrap();
        two.subscribe("a", |_| {}).unwrap();
        one.unsubscribe_all();
        assert_eq!(table.get("a").unwrap().len(), 1);
        assert!(one.topics().is_empty());
    }

    #[test]
    fn drop_unsubscribes() {
        let table = table();
        {
            let sub = Subscriber::new(1, table.clone());
            sub.subscribe("a", |_| {}).unwrap();
            sub.subscribe("b", |_| {}).unwrap();
        }
        assert!(table.is_empty());
    }

    #[test]
    fn close_rejects_new_subscriptions() {
        let table = table();
        let sub = Subscriber::new(4, table.clone());
        sub.subscribe("a", |_| {}).unwrap();
        sub.close();
        assert!(sub.is_closed());
        assert!(table.is_empty());

        let err = sub.subscribe("a", |_| {}).unwrap_err();
        assert_eq!(err, PubSubError::SubscriberClosed { id: 4 });
        assert!(table.is_empty());
        assert!(sub.topics().is_empty());
    }

    #[test]
    fn unsubscribe_all_keeps_subscriber_usable() {
        let table = table();
        let sub = Subscriber::new(1, table.clone());
        sub.subscribe("a", |_| {}).unwrap();
        sub.unsubscribe_all();
        assert!(!sub.is_closed());
        sub.subscribe("b", |_| {}).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn debug_shows_id() {
        let sub = Subscriber::new(9, table());
        assert!(format!("{sub:?}").contains("id: 9"));
    }
}
