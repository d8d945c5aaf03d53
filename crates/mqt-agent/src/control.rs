//! Control protocol handler
//!
//! Applies decoded control packets to the topic router and publishes this
//! peer's own packets on the control topic.

use std::sync::Arc;

use bytes::Bytes;

use mqt_core::{MqtError, PublishToken};
use mqt_protocol::{CloseTunnel, ControlCommand, OpenParams, OpenTunnel, QualityLevel, TopicName};

use crate::router::{OpenOutcome, TopicRouter, CONTROL_QUALITY};
use crate::tunnel::{TunnelHandle, TunnelSpec};

/// A tunnel provisioned on a peer's request, ready for an adapter
#[derive(Debug)]
pub struct OpenedTunnel {
    pub handle: TunnelHandle,
    /// Address hints from the open packet
    pub params: OpenParams,
}

/// What applying a control command did
#[derive(Debug)]
pub enum ControlOutcome {
    Opened(OpenedTunnel),
    AlreadyOpen(TopicName),
    Closed(TopicName),
    NotRegistered(TopicName),
    /// Own echo or unknown kind
    Ignored,
    /// Rejected or failed against the broker; the registry is unchanged
    Failed(MqtError),
}

pub struct ControlHandler {
    origin: String,
    default_quality: QualityLevel,
    router: Arc<TopicRouter>,
}

impl ControlHandler {
    /// `origin` is this peer's client identifier
    pub fn new(origin: impl Into<String>, default_quality: QualityLevel, router: Arc<TopicRouter>) -> Self {
        Self {
            origin: origin.into(),
            default_quality,
            router,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    /// Apply one decoded control packet. Never fails the session.
    pub async fn apply(&self, command: ControlCommand) -> ControlOutcome {
        if command.origin() == Some(self.origin.as_str()) {
            tracing::trace!("Skipping own {} packet", command.kind());
            return ControlOutcome::Ignored;
        }

        match command {
            ControlCommand::Open(open) => self.on_open(open).await,
            ControlCommand::Close(close) => self.on_close(close).await,
            ControlCommand::Unknown { kind, topic } => {
                tracing::info!(
                    "Ignoring control packet of unknown kind '{}' (topic: {:?})",
                    kind,
                    topic.as_ref().map(TopicName::as_str)
                );
                ControlOutcome::Ignored
            }
        }
    }

    async fn on_open(&self, open: OpenTunnel) -> ControlOutcome {
        let mut spec = TunnelSpec::new(open.topic, open.quality.unwrap_or(self.default_quality));
        spec.peer_topic = open.params.peer_topic.clone();

        match self.router.open(spec).await {
            Ok(OpenOutcome::Existing(tunnel)) => ControlOutcome::AlreadyOpen(tunnel.topic().clone()),
            Ok(OpenOutcome::Created(tunnel)) => match tunnel.take_handle() {
                Some(handle) => ControlOutcome::Opened(OpenedTunnel {
                    handle,
                    params: open.params,
                }),
                None => ControlOutcome::AlreadyOpen(tunnel.topic().clone()),
            },
            Err(e) => {
                tracing::warn!("Rejected open request: {}", e);
                ControlOutcome::Failed(e)
            }
        }
    }

    async fn on_close(&self, close: CloseTunnel) -> ControlOutcome {
        match self.router.close(&close.topic).await {
            Ok(Some(_)) => ControlOutcome::Closed(close.topic),
            Ok(None) => ControlOutcome::NotRegistered(close.topic),
            Err(e) => {
                tracing::warn!("Failed to close {}: {}", close.topic, e);
                ControlOutcome::Failed(e)
            }
        }
    }

    /// Tear down a tunnel whose adapter finished, and tell the peer.
    ///
    /// Returns `false` when the topic was no longer registered, in which case
    /// nothing is published.
    pub async fn release(&self, topic: &TopicName) -> Result<bool, MqtError> {
        let Some(tunnel) = self.router.close(topic).await? else {
            return Ok(false);
        };

        if let Some(peer_topic) = tunnel.peer_topic() {
            let close = CloseTunnel::new(peer_topic.clone());
            self.publish_control(ControlCommand::Close(close)).await?;
        }
        Ok(true)
    }

    /// Ask peers to provision the tunnel described by `open`
    pub async fn announce(&self, open: OpenTunnel) -> Result<PublishToken, MqtError> {
        self.publish_control(ControlCommand::Open(open)).await
    }

    async fn publish_control(&self, mut command: ControlCommand) -> Result<PublishToken, MqtError> {
        match &mut command {
            ControlCommand::Open(open) => open.params.origin = Some(self.origin.clone()),
            ControlCommand::Close(close) => close.params.origin = Some(self.origin.clone()),
            ControlCommand::Unknown { .. } => {}
        }

        let payload = mqt_protocol::encode(&command)?;
        tracing::debug!("Publishing {} packet on {}", command.kind(), self.router.control_topic());
        let token = self
            .router
            .broker()
            .publish(self.router.control_topic(), CONTROL_QUALITY, false, Bytes::from(payload))
            .await?;
        Ok(token)
    }
}
