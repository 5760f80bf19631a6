//! In-process publish/subscribe event broker
//!
//! Storage mutations are announced here after they commit; the session manager and
//! any UI consume them through a [`Subscription`]. Each subscription owns a bounded
//! inbox that drops its oldest entry when full, and a new subscription is replayed
//! the last event of every topic it asks for.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::config::BrokerConfig;
use crate::errors::{PeerpostError, Result};
use crate::model::{Contact, Message, MessageState};
use crate::types::PublicKeyHex;

/// Default inbox capacity of a subscription
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;

// ----------------------------------------------------------------------------
// Topics and Payloads
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    DatabaseOpened,
    AccountsChanged,
    CurrentAccountChanged,
    ContactsChanged,
    ContactSaved,
    MessageSent,
    MessageReceived,
    MessageStateChanged,
    MessagesStateChanged,
}

impl Topic {
    pub const ALL: [Topic; 9] = [
        Topic::DatabaseOpened,
        Topic::AccountsChanged,
        Topic::CurrentAccountChanged,
        Topic::ContactsChanged,
        Topic::ContactSaved,
        Topic::MessageSent,
        Topic::MessageReceived,
        Topic::MessageStateChanged,
        Topic::MessagesStateChanged,
    ];
}

/// Typed event data; every variant carries owned copies
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    DatabaseOpened,
    AccountsChanged,
    CurrentAccountChanged {
        previous: Option<PublicKeyHex>,
        current: Option<PublicKeyHex>,
    },
    ContactsChanged {
        account: PublicKeyHex,
    },
    ContactSaved(Contact),
    MessageSent(Message),
    MessageReceived(Message),
    MessageStateChanged {
        message: Message,
        previous: MessageState,
    },
    MessagesStateChanged {
        account: PublicKeyHex,
        contact: PublicKeyHex,
        count: usize,
    },
}

impl EventPayload {
    pub fn topic(&self) -> Topic {
        match self {
            EventPayload::DatabaseOpened => Topic::DatabaseOpened,
            EventPayload::AccountsChanged => Topic::AccountsChanged,
            EventPayload::CurrentAccountChanged { .. } => Topic::CurrentAccountChanged,
            EventPayload::ContactsChanged { .. } => Topic::ContactsChanged,
            EventPayload::ContactSaved(_) => Topic::ContactSaved,
            EventPayload::MessageSent(_) => Topic::MessageSent,
            EventPayload::MessageReceived(_) => Topic::MessageReceived,
            EventPayload::MessageStateChanged { .. } => Topic::MessageStateChanged,
            EventPayload::MessagesStateChanged { .. } => Topic::MessagesStateChanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub payload: EventPayload,
    /// Set on events replayed from the last-event cache
    pub cached: bool,
    pub error: Option<String>,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            cached: false,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }
}

impl From<EventPayload> for Event {
    fn from(payload: EventPayload) -> Self {
        Event::new(payload)
    }
}

// ----------------------------------------------------------------------------
// Broker
// ----------------------------------------------------------------------------

struct SubscriberState {
    topics: RwLock<HashSet<Topic>>,
    closed: AtomicBool,
}

impl SubscriberState {
    fn is_subscribed_to(&self, topic: Topic) -> bool {
        self.topics
            .read()
            .map(|topics| topics.contains(&topic))
            .unwrap_or(false)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct SubscriberEntry {
    state: Arc<SubscriberState>,
    sender: broadcast::Sender<Event>,
}

struct BrokerInner {
    cache: DashMap<Topic, Event>,
    subscribers: DashMap<u64, SubscriberEntry>,
    next_id: AtomicU64,
    capacity: usize,
}

impl BrokerInner {
    fn replay(&self, topics: &HashSet<Topic>, sender: &broadcast::Sender<Event>) {
        for topic in topics {
            if let Some(event) = self.cache.get(topic) {
                let mut replayed = event.value().clone();
                replayed.cached = true;
                let _ = sender.send(replayed);
            }
        }
    }
}

/// Cloneable handle to a shared broker
#[derive(Clone)]
pub struct EventBroker {
    inner: Arc<BrokerInner>,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl core::fmt::Debug for EventBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBroker")
            .field("subscribers", &self.inner.subscribers.len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl EventBroker {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(config.subscriber_capacity)
    }

    /// Inbox capacity of every subscription
    pub fn subscriber_capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Create a broker whose subscriptions hold `capacity` events each
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                cache: DashMap::new(),
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Subscribe to `topics`; an empty slice subscribes to every topic
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        let topics = expand_topics(topics);
        let (sender, receiver) = broadcast::channel(self.inner.capacity);
        self.inner.replay(&topics, &sender);

        let state = Arc::new(SubscriberState {
            topics: RwLock::new(topics),
            closed: AtomicBool::new(false),
        });
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.insert(
            id,
            SubscriberEntry {
                state: state.clone(),
                sender,
            },
        );
        debug!(subscriber = id, "event subscriber registered");

        Subscription {
            id,
            state,
            receiver,
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Publish `event`, caching it as the last event of its topic
    pub fn fire(&self, event: impl Into<Event>) {
        let mut event = event.into();
        event.cached = false;
        let topic = event.topic();
        self.inner.cache.insert(topic, event.clone());

        let mut closed = Vec::new();
        for entry in self.inner.subscribers.iter() {
            if entry.state.is_closed() {
                closed.push(*entry.key());
                continue;
            }
            if entry.state.is_subscribed_to(topic) {
                // A full inbox overwrites its oldest entry.
                let _ = entry.sender.send(event.clone());
            }
        }
        for id in closed {
            self.inner.subscribers.remove(&id);
            trace!(subscriber = id, "evicted closed subscriber");
        }
    }

    /// Last event fired on `topic`, if any
    pub fn last_event(&self, topic: Topic) -> Option<Event> {
        self.inner.cache.get(&topic).map(|e| e.value().clone())
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

fn expand_topics(topics: &[Topic]) -> HashSet<Topic> {
    if topics.is_empty() {
        Topic::ALL.iter().copied().collect()
    } else {
        topics.iter().copied().collect()
    }
}

// ----------------------------------------------------------------------------
// Subscription
// ----------------------------------------------------------------------------

/// Receiving end of a broker subscription
pub struct Subscription {
    id: u64,
    state: Arc<SubscriberState>,
    receiver: broadcast::Receiver<Event>,
    broker: Weak<BrokerInner>,
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Subscription {
    fn ensure_open(&self) -> Result<()> {
        if self.state.is_closed() {
            return Err(PeerpostError::channel_error("subscription already closed"));
        }
        Ok(())
    }

    /// Wait for the next event; `None` once closed
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if self.state.is_closed() {
                return None;
            }
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(subscriber = self.id, skipped, "subscriber inbox overflowed");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next queued event without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            if self.state.is_closed() {
                return None;
            }
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    debug!(subscriber = self.id, skipped, "subscriber inbox overflowed");
                }
                Err(_) => return None,
            }
        }
    }

    /// Add topics (all topics when empty), replaying their cached events
    pub fn subscribe(&mut self, topics: &[Topic]) -> Result<()> {
        self.ensure_open()?;
        let requested = expand_topics(topics);
        let added: HashSet<Topic> = {
            let mut current = self
                .state
                .topics
                .write()
                .map_err(|_| PeerpostError::channel_error("subscriber topics poisoned"))?;
            let added = requested.difference(&current).copied().collect();
            current.extend(requested);
            added
        };
        if let Some(broker) = self.broker.upgrade() {
            if let Some(entry) = broker.subscribers.get(&self.id) {
                broker.replay(&added, &entry.sender);
            }
        }
        Ok(())
    }

    /// Remove topics; an empty slice removes every topic but keeps the subscription open
    pub fn unsubscribe(&mut self, topics: &[Topic]) -> Result<()> {
        self.ensure_open()?;
        let mut current = self
            .state
            .topics
            .write()
            .map_err(|_| PeerpostError::channel_error("subscriber topics poisoned"))?;
        if topics.is_empty() {
            current.clear();
        } else {
            for topic in topics {
                current.remove(topic);
            }
        }
        Ok(())
    }

    pub fn is_subscribed_to(&self, topic: Topic) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.state.is_subscribed_to(topic))
    }

    pub fn topics(&self) -> Result<Vec<Topic>> {
        self.ensure_open()?;
        let current = self
            .state
            .topics
            .read()
            .map_err(|_| PeerpostError::channel_error("subscriber topics poisoned"))?;
        Ok(Topic::ALL
            .iter()
            .copied()
            .filter(|topic| current.contains(topic))
            .collect())
    }

    /// Unsubscribe from everything and make this subscription inert
    pub fn close(&mut self) {
        if let Ok(mut topics) = self.state.topics.write() {
            topics.clear();
        }
        self.state.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.state.closed.store(true, Ordering::Release);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn contacts_changed(byte: u8) -> Event {
        Event::new(EventPayload::ContactsChanged {
            account: PublicKeyHex::from_bytes(&[byte; 32]),
        })
    }

    #[tokio::test]
    async fn test_fire_reaches_matching_subscribers_only() {
        let broker = EventBroker::default();
        let mut contacts = broker.subscribe(&[Topic::ContactsChanged]);
        let mut accounts = broker.subscribe(&[Topic::AccountsChanged]);

        broker.fire(contacts_changed(1));

        let event = contacts.recv().await.unwrap();
        assert_eq!(event.topic(), Topic::ContactsChanged);
        assert!(!event.cached);
        assert!(accounts.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_replay_on_subscribe() {
        let broker = EventBroker::default();
        broker.fire(EventPayload::AccountsChanged);
        broker.fire(contacts_changed(1));
        broker.fire(contacts_changed(2));

        let mut sub = broker.subscribe(&[Topic::ContactsChanged]);
        let replayed = sub.try_recv().unwrap();
        assert!(replayed.cached);
        assert_eq!(replayed.payload, contacts_changed(2).payload);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_empty_topics_means_all() {
        let broker = EventBroker::default();
        let sub = broker.subscribe(&[]);
        for topic in Topic::ALL {
            assert!(sub.is_subscribed_to(topic).unwrap());
        }
        assert_eq!(sub.topics().unwrap().len(), Topic::ALL.len());
    }

    #[test]
    fn test_full_inbox_drops_oldest() {
        let broker = EventBroker::new(4);
        let mut sub = broker.subscribe(&[Topic::ContactsChanged]);
        for i in 0..10u8 {
            broker.fire(contacts_changed(i));
        }

        let mut seen = Vec::new();
        while let Some(event) = sub.try_recv() {
            seen.push(event.payload);
        }
        let newest: Vec<_> = (6..10u8).map(|i| contacts_changed(i).payload).collect();
        assert_eq!(seen, newest);
    }

    #[test]
    fn test_capacity_from_config() {
        let broker = EventBroker::from_config(&BrokerConfig {
            subscriber_capacity: 2,
        });
        assert_eq!(broker.subscriber_capacity(), 2);
        let mut sub = broker.subscribe(&[Topic::ContactsChanged]);
        for i in 0..5u8 {
            broker.fire(contacts_changed(i));
        }
        let mut seen = 0;
        while sub.try_recv().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_unsubscribe_and_resubscribe() {
        let broker = EventBroker::default();
        let mut sub = broker.subscribe(&[Topic::ContactsChanged, Topic::MessageSent]);
        sub.unsubscribe(&[Topic::ContactsChanged]).unwrap();
        assert!(!sub.is_subscribed_to(Topic::ContactsChanged).unwrap());
        assert!(sub.is_subscribed_to(Topic::MessageSent).unwrap());

        broker.fire(contacts_changed(3));
        assert!(sub.try_recv().is_none());

        sub.subscribe(&[Topic::ContactsChanged]).unwrap();
        let replayed = sub.try_recv().unwrap();
        assert!(replayed.cached);

        sub.unsubscribe(&[]).unwrap();
        assert!(sub.topics().unwrap().is_empty());
        assert!(!sub.is_closed());
    }

    #[test]
    fn test_closed_subscription_is_inert_and_evicted() {
        let broker = EventBroker::default();
        let mut sub = broker.subscribe(&[]);
        assert_eq!(broker.subscriber_count(), 1);

        sub.close();
        assert!(sub.is_closed());
        assert!(sub.subscribe(&[Topic::AccountsChanged]).is_err());
        assert!(sub.topics().is_err());

        broker.fire(EventPayload::AccountsChanged);
        assert!(sub.try_recv().is_none());
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[test]
    fn test_dropped_subscription_is_evicted() {
        let broker = EventBroker::default();
        drop(broker.subscribe(&[]));
        broker.fire(EventPayload::DatabaseOpened);
        assert_eq!(broker.subscriber_count(), 0);
        assert!(broker.last_event(Topic::DatabaseOpened).is_some());
    }
}
