//! Tunnels: one topic bridged to one byte stream
//!
//! A [`Tunnel`] is owned by its registry entry. The byte-stream adapter gets
//! a [`TunnelHandle`] that reads the inbound queue and publishes through a
//! weak reference, so dropping the registry entry is enough to stop
//! outbound traffic.

mod handle;

pub use handle::{TunnelHandle, TunnelReader, TunnelWriter};

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use mqt_core::{BrokerClient, MqtError, OverflowPolicy, PublishToken, TunnelError};
use mqt_protocol::{QualityLevel, TopicName};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lifecycle of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    /// Accepting inbound chunks and publishing
    Open,
    /// No new inbound chunks; queued chunks still drain to the adapter
    Closing,
    /// Drained
    Closed,
}

/// What to provision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    /// Topic the tunnel subscribes to
    pub topic: TopicName,
    /// Topic outbound bytes go to; the tunnel's own topic when unset
    pub peer_topic: Option<TopicName>,
    pub quality: QualityLevel,
}

impl TunnelSpec {
    pub fn new(topic: TopicName, quality: QualityLevel) -> Self {
        Self {
            topic,
            peer_topic: None,
            quality,
        }
    }

    pub fn with_peer(mut self, peer_topic: TopicName) -> Self {
        self.peer_topic = Some(peer_topic);
        self
    }
}

/// Outcome of pushing an inbound chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the adapter
    Queued,
    /// Queue full under the drop-newest policy
    Dropped,
}

/// Shared pieces a tunnel is built from
#[derive(Clone)]
pub(crate) struct TunnelContext {
    pub broker: Arc<dyn BrokerClient>,
    pub capacity: usize,
    pub drop_when_full: bool,
    /// Longest a blocked delivery waits for queue space
    pub delivery_timeout: Duration,
    /// Where adapters ask for their tunnel to be released
    pub release: Option<mpsc::UnboundedSender<TopicName>>,
}

pub struct Tunnel {
    spec: TunnelSpec,
    overflow: OverflowPolicy,
    delivery_timeout: Duration,
    inbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    /// Held until an adapter takes the handle
    pending_reader: Mutex<Option<mpsc::Receiver<Bytes>>>,
    status: Arc<watch::Sender<TunnelStatus>>,
    closing: CancellationToken,
    broker: Arc<dyn BrokerClient>,
    release: Option<mpsc::UnboundedSender<TopicName>>,
}

impl Tunnel {
    pub(crate) fn new(spec: TunnelSpec, ctx: &TunnelContext) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(ctx.capacity.max(1));
        let (status, _) = watch::channel(TunnelStatus::Open);

        Arc::new(Self {
            overflow: OverflowPolicy::for_quality(spec.quality, ctx.drop_when_full),
            delivery_timeout: ctx.delivery_timeout,
            spec,
            inbound: Mutex::new(Some(tx)),
            pending_reader: Mutex::new(Some(rx)),
            status: Arc::new(status),
            closing: CancellationToken::new(),
            broker: Arc::clone(&ctx.broker),
            release: ctx.release.clone(),
        })
    }

    pub fn topic(&self) -> &TopicName {
        &self.spec.topic
    }

    pub fn peer_topic(&self) -> Option<&TopicName> {
        self.spec.peer_topic.as_ref()
    }

    /// Where outbound bytes are published
    pub fn publish_topic(&self) -> &TopicName {
        self.spec.peer_topic.as_ref().unwrap_or(&self.spec.topic)
    }

    pub fn quality(&self) -> QualityLevel {
        self.spec.quality
    }

    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    pub fn status(&self) -> TunnelStatus {
        *self.status.borrow()
    }

    /// Push an inbound chunk.
    ///
    /// Under the blocking policy this waits for queue space; closing the
    /// tunnel interrupts the wait. A wait longer than the delivery timeout
    /// fails with [`TunnelError::Stalled`] and the chunk is not queued.
    /// Chunks are queued in call order.
    pub async fn deliver(&self, payload: Bytes) -> Result<Delivery, TunnelError> {
        let closed = || TunnelError::Closed(self.spec.topic.clone());
        let sender = lock(&self.inbound).clone().ok_or_else(closed)?;

        match self.overflow {
            OverflowPolicy::DropNewest => match sender.try_send(payload) {
                Ok(()) => Ok(Delivery::Queued),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("Inbound queue full for {}, dropping chunk", self.spec.topic);
                    Ok(Delivery::Dropped)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(closed()),
            },
            OverflowPolicy::Block => {
                tokio::select! {
                    sent = sender.send(payload) => sent.map(|_| Delivery::Queued).map_err(|_| closed()),
                    _ = self.closing.cancelled() => Err(closed()),
                    _ = tokio::time::sleep(self.delivery_timeout) => {
                        Err(TunnelError::Stalled(self.spec.topic.clone()))
                    }
                }
            }
        }
    }

    /// Publish outbound bytes at the tunnel's quality
    pub async fn publish(&self, payload: Bytes) -> Result<PublishToken, MqtError> {
        if self.status() != TunnelStatus::Open {
            return Err(TunnelError::Closed(self.spec.topic.clone()).into());
        }

        let token = self
            .broker
            .publish(self.publish_topic(), self.spec.quality, false, payload)
            .await?;
        Ok(token)
    }

    /// Hand out the adapter's handle. Only the first call succeeds.
    pub fn take_handle(self: &Arc<Self>) -> Option<TunnelHandle> {
        let inbound = lock(&self.pending_reader).take()?;
        Some(TunnelHandle::new(self, inbound, Arc::clone(&self.status)))
    }

    /// Stop accepting inbound chunks and let the queue drain
    pub fn close(&self) {
        let started = self.status.send_if_modified(|status| {
            if *status == TunnelStatus::Open {
                *status = TunnelStatus::Closing;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }

        lock(&self.inbound).take();
        self.closing.cancel();

        // Nobody will drain a queue whose handle was never taken
        if lock(&self.pending_reader).take().is_some() {
            self.status.send_replace(TunnelStatus::Closed);
        }
        tracing::debug!("Tunnel {} closing", self.spec.topic);
    }

    /// Ask the owner to tear this tunnel down
    pub(crate) fn request_release(&self) {
        match &self.release {
            Some(release) if release.send(self.spec.topic.clone()).is_ok() => {}
            _ => self.close(),
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("topic", &self.spec.topic)
            .field("publish_topic", self.publish_topic())
            .field("quality", &self.spec.quality)
            .field("status", &self.status())
            .finish()
    }
}
