//! In-memory broker shared by the integration tests
//!
//! A [`MemoryBus`] relays publications to every attached [`MemoryBroker`]
//! subscribed on the exact topic, the way a real broker would between two
//! peers.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use mqt_agent::{BrokerEvent, InboundMessage};
use mqt_core::config::AgentConfig;
use mqt_core::{BrokerClient, BrokerError, ConnectionState, PublishToken, SubscriptionSet};
use mqt_protocol::{QualityLevel, TopicName};

#[derive(Default)]
pub struct MemoryBus {
    clients: Mutex<Vec<Weak<MemoryBroker>>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new client to the bus
    pub fn client(self: &Arc<Self>) -> (Arc<MemoryBroker>, mpsc::Receiver<BrokerEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let broker = Arc::new(MemoryBroker {
            bus: Arc::clone(self),
            events: tx,
            subscriptions: Mutex::new(BTreeSet::new()),
            published: Mutex::new(Vec::new()),
            subscribe_calls: AtomicUsize::new(0),
            unsubscribe_calls: AtomicUsize::new(0),
            fail_subscribe: Mutex::new(None),
            fail_unsubscribe: Mutex::new(None),
            state: Mutex::new(ConnectionState::Connected),
        });
        self.clients.lock().unwrap().push(Arc::downgrade(&broker));
        (broker, rx)
    }

    async fn route(&self, topic: &TopicName, payload: Bytes) {
        let receivers: Vec<mpsc::Sender<BrokerEvent>> = self
            .clients
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|client| client.is_subscribed(topic))
            .map(|client| client.events.clone())
            .collect();

        for events in receivers {
            let message = InboundMessage::new(topic.clone(), payload.clone());
            let _ = events.send(BrokerEvent::Message(message)).await;
        }
    }
}

/// One client session on a [`MemoryBus`]
pub struct MemoryBroker {
    bus: Arc<MemoryBus>,
    events: mpsc::Sender<BrokerEvent>,
    subscriptions: Mutex<BTreeSet<TopicName>>,
    published: Mutex<Vec<(TopicName, Bytes)>>,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
    fail_subscribe: Mutex<Option<BrokerError>>,
    fail_unsubscribe: Mutex<Option<BrokerError>>,
    state: Mutex<ConnectionState>,
}

impl MemoryBroker {
    /// A client on a private bus
    pub fn standalone() -> (Arc<Self>, mpsc::Receiver<BrokerEvent>) {
        MemoryBus::new().client()
    }

    pub fn is_subscribed(&self, topic: &TopicName) -> bool {
        self.subscriptions.lock().unwrap().contains(topic)
    }

    pub fn subscriptions(&self) -> BTreeSet<TopicName> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(TopicName, Bytes)> {
        self.published.lock().unwrap().clone()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_subscribe(&self, err: BrokerError) {
        *self.fail_subscribe.lock().unwrap() = Some(err);
    }

    pub fn fail_next_unsubscribe(&self, err: BrokerError) {
        *self.fail_unsubscribe.lock().unwrap() = Some(err);
    }

    /// Forget every subscription, as a broker does for a clean session
    pub fn drop_session(&self) {
        self.subscriptions.lock().unwrap().clear();
    }

    /// Push a connection event as the connection manager would
    pub async fn inject(&self, event: BrokerEvent) {
        self.events.send(event).await.unwrap();
    }

    /// Publish `payload` on `topic` as some other client
    pub async fn deliver(&self, topic: &str, payload: &'static [u8]) {
        self.bus.route(&TopicName::from(topic), Bytes::from_static(payload)).await;
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn subscribe(&self, topics: &SubscriptionSet) -> Result<(), BrokerError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_subscribe.lock().unwrap().take() {
            return Err(err);
        }
        self.subscriptions.lock().unwrap().extend(topics.keys().cloned());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &TopicName) -> Result<(), BrokerError> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_unsubscribe.lock().unwrap().take() {
            return Err(err);
        }
        self.subscriptions.lock().unwrap().remove(topic);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &TopicName,
        _quality: QualityLevel,
        _retained: bool,
        payload: Bytes,
    ) -> Result<PublishToken, BrokerError> {
        if self.state() == ConnectionState::Closed {
            return Err(BrokerError::Closed);
        }
        self.published.lock().unwrap().push((topic.clone(), payload.clone()));
        self.bus.route(topic, payload).await;
        Ok(PublishToken::completed(Ok(())))
    }

    async fn close(&self) {
        *self.state.lock().unwrap() = ConnectionState::Closed;
    }
}

/// Prepared configuration for a test peer
pub fn peer_config(client_id: &str) -> AgentConfig {
    AgentConfig {
        client_id: Some(client_id.to_string()),
        inbound_capacity: 8,
        ..AgentConfig::default()
    }
    .prepare(None)
    .unwrap()
}

/// Poll `condition` until it holds or a second passes
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
