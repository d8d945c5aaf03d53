//! Topic router
//!
//! Holds the topic registry and is the single dispatch point for inbound
//! publications. Lookups go straight to the concurrent map; every
//! read-modify-write of the registry (subscribe + insert, unsubscribe +
//! remove, resubscribe) runs under one mutation lock so the registry and the
//! broker's subscription set never diverge.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use mqt_core::config::AgentConfig;
use mqt_core::{BrokerClient, BrokerError, MqtError, SubscriptionSet, TunnelError};
use mqt_protocol::{ControlCommand, QualityLevel, TopicName};

use crate::broker::InboundMessage;
use crate::tunnel::{Delivery, Tunnel, TunnelContext, TunnelSpec};

/// Quality the control topic is subscribed at
pub const CONTROL_QUALITY: QualityLevel = QualityLevel::AtLeastOnce;

/// Per-tunnel queue settings
#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    pub inbound_capacity: usize,
    pub drop_when_full: bool,
    /// Longest dispatch waits on a full queue before tearing the tunnel down
    pub delivery_timeout: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            inbound_capacity: 256,
            drop_when_full: false,
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&AgentConfig> for RouterSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            inbound_capacity: config.inbound_capacity,
            drop_when_full: config.drop_when_full,
            delivery_timeout: config.delivery_timeout,
        }
    }
}

/// Result of [`TopicRouter::open`]
#[derive(Debug, Clone)]
pub enum OpenOutcome {
    /// A new tunnel was subscribed and registered
    Created(Arc<Tunnel>),
    /// The topic was already registered; nothing changed
    Existing(Arc<Tunnel>),
}

impl OpenOutcome {
    pub fn tunnel(&self) -> &Arc<Tunnel> {
        match self {
            OpenOutcome::Created(tunnel) | OpenOutcome::Existing(tunnel) => tunnel,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, OpenOutcome::Created(_))
    }
}

/// Where an inbound message ended up
#[derive(Debug)]
pub enum Dispatch {
    /// Control-topic payload, decoded
    Control(ControlCommand),
    /// Control-topic payload that failed to decode
    MalformedControl,
    /// Queued on the owning tunnel
    Delivered,
    /// Owning tunnel's queue was full under the drop-newest policy
    Dropped,
    /// Owning tunnel is closing
    TunnelClosed,
    /// Owning tunnel's adapter stopped draining; the tunnel is being released
    Stalled,
    /// No tunnel registered for the topic
    Unrouted,
}

/// Topic registry and inbound dispatch
pub struct TopicRouter {
    control: TopicName,
    registry: DashMap<TopicName, Arc<Tunnel>>,
    mutation: tokio::sync::Mutex<()>,
    ctx: TunnelContext,
}

impl TopicRouter {
    pub fn new(control: TopicName, broker: Arc<dyn BrokerClient>, settings: RouterSettings) -> Self {
        Self {
            control,
            registry: DashMap::new(),
            mutation: tokio::sync::Mutex::new(()),
            ctx: TunnelContext {
                broker,
                capacity: settings.inbound_capacity,
                drop_when_full: settings.drop_when_full,
                delivery_timeout: settings.delivery_timeout,
                release: None,
            },
        }
    }

    /// Route adapter release requests to `release`
    pub fn with_release_channel(mut self, release: mpsc::UnboundedSender<TopicName>) -> Self {
        self.ctx.release = Some(release);
        self
    }

    pub fn control_topic(&self) -> &TopicName {
        &self.control
    }

    pub fn broker(&self) -> &Arc<dyn BrokerClient> {
        &self.ctx.broker
    }

    pub fn get(&self, topic: &TopicName) -> Option<Arc<Tunnel>> {
        self.registry.get(topic).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, topic: &TopicName) -> bool {
        self.registry.contains_key(topic)
    }

    /// Registered tunnel topics, sorted
    pub fn topics(&self) -> Vec<TopicName> {
        let mut topics: Vec<TopicName> = self.registry.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Control topic plus every registered tunnel
    pub fn subscription_set(&self) -> SubscriptionSet {
        let mut set: SubscriptionSet = self
            .registry
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().quality()))
            .collect();
        set.insert(self.control.clone(), CONTROL_QUALITY);
        set
    }

    /// Provision a tunnel for `spec.topic`.
    ///
    /// Idempotent: an already registered topic returns the existing tunnel
    /// untouched. The registry only changes once the broker acknowledged the
    /// subscription.
    pub async fn open(&self, spec: TunnelSpec) -> Result<OpenOutcome, MqtError> {
        if spec.topic == self.control {
            return Err(TunnelError::ReservedTopic(spec.topic).into());
        }
        if spec.peer_topic.as_ref() == Some(&self.control) {
            return Err(TunnelError::ReservedTopic(self.control.clone()).into());
        }

        let _guard = self.mutation.lock().await;

        if let Some(existing) = self.get(&spec.topic) {
            tracing::debug!("Tunnel {} already open", spec.topic);
            return Ok(OpenOutcome::Existing(existing));
        }

        let mut topics = self.subscription_set();
        topics.insert(spec.topic.clone(), spec.quality);
        self.ctx.broker.subscribe(&topics).await?;

        let tunnel = Tunnel::new(spec, &self.ctx);
        self.registry.insert(tunnel.topic().clone(), Arc::clone(&tunnel));
        tracing::info!(
            "Opened tunnel {} (publishing to {}, {})",
            tunnel.topic(),
            tunnel.publish_topic(),
            tunnel.quality()
        );

        Ok(OpenOutcome::Created(tunnel))
    }

    /// Tear down the tunnel for `topic`.
    ///
    /// Returns `None` when the topic is not registered. The registry entry is
    /// removed only after the broker acknowledged the unsubscribe; on error
    /// it stays in place.
    ///
    /// Removal happens before the inbound queue drains. The removed tunnel is
    /// only `Closing` at that point: it accepts nothing new, and the adapter's
    /// handle keeps reading queued chunks until the queue is empty, which
    /// moves the tunnel to `Closed`. A reopen of the same topic during the
    /// drain gets a fresh tunnel.
    pub async fn close(&self, topic: &TopicName) -> Result<Option<Arc<Tunnel>>, MqtError> {
        let _guard = self.mutation.lock().await;

        if !self.contains(topic) {
            tracing::debug!("Close for unregistered topic {}", topic);
            return Ok(None);
        }

        self.ctx.broker.unsubscribe(topic).await?;

        let removed = self.registry.remove(topic).map(|(_, tunnel)| tunnel);
        if let Some(tunnel) = &removed {
            tunnel.close();
            tracing::info!("Closed tunnel {}", topic);
        }
        Ok(removed)
    }

    /// Re-issue the full subscription set after a reconnect
    pub async fn resubscribe_all(&self) -> Result<usize, BrokerError> {
        let _guard = self.mutation.lock().await;

        let topics = self.subscription_set();
        self.ctx.broker.subscribe(&topics).await?;
        tracing::info!("Restored {} subscriptions", topics.len());
        Ok(topics.len())
    }

    /// Close every tunnel without touching the broker. Used at shutdown.
    pub async fn close_all(&self) -> usize {
        let _guard = self.mutation.lock().await;

        let topics: Vec<TopicName> = self.registry.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for topic in topics {
            if let Some((_, tunnel)) = self.registry.remove(&topic) {
                tunnel.close();
                closed += 1;
            }
        }
        closed
    }

    /// Route one inbound publication.
    ///
    /// The control topic always wins, even over a tunnel registered under
    /// the same name. A blocked delivery is bounded by the delivery timeout;
    /// a tunnel that exceeds it is closed and handed to the release channel
    /// so later messages are not held up behind it.
    pub async fn dispatch(&self, message: InboundMessage) -> Dispatch {
        if message.topic == self.control {
            return match mqt_protocol::decode(&message.payload) {
                Ok(command) => Dispatch::Control(command),
                Err(e) => {
                    tracing::warn!("Dropping malformed control packet: {}", e);
                    Dispatch::MalformedControl
                }
            };
        }

        let Some(tunnel) = self.get(&message.topic) else {
            tracing::debug!(
                "Dropping {} bytes for unknown topic {}",
                message.payload.len(),
                message.topic
            );
            return Dispatch::Unrouted;
        };

        match tunnel.deliver(message.payload).await {
            Ok(Delivery::Queued) => Dispatch::Delivered,
            Ok(Delivery::Dropped) => Dispatch::Dropped,
            Err(TunnelError::Stalled(topic)) => {
                tracing::warn!("Inbound queue for {} stayed full, releasing tunnel", topic);
                tunnel.close();
                tunnel.request_release();
                Dispatch::Stalled
            }
            Err(e) => {
                tracing::debug!("Dropping inbound chunk: {}", e);
                Dispatch::TunnelClosed
            }
        }
    }
}
