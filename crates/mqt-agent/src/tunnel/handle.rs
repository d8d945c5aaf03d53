//! Adapter-side tunnel handles

use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use mqt_core::{MqtError, PublishToken, TunnelError};
use mqt_protocol::TopicName;

use super::{Tunnel, TunnelStatus};

/// Non-owning handle given to a byte-stream adapter
#[derive(Debug)]
pub struct TunnelHandle {
    reader: TunnelReader,
    writer: TunnelWriter,
}

impl TunnelHandle {
    pub(super) fn new(
        tunnel: &Arc<Tunnel>,
        inbound: mpsc::Receiver<Bytes>,
        status: Arc<watch::Sender<TunnelStatus>>,
    ) -> Self {
        let topic = tunnel.topic().clone();
        Self {
            reader: TunnelReader {
                topic: topic.clone(),
                inbound,
                status,
            },
            writer: TunnelWriter {
                topic,
                tunnel: Arc::downgrade(tunnel),
            },
        }
    }

    pub fn topic(&self) -> &TopicName {
        &self.reader.topic
    }

    /// Next inbound chunk; `None` once the tunnel closed and drained
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.reader.recv().await
    }

    pub async fn publish(&self, payload: Bytes) -> Result<PublishToken, MqtError> {
        self.writer.publish(payload).await
    }

    pub fn release(&self) {
        self.writer.release();
    }

    pub fn status(&self) -> TunnelStatus {
        self.reader.status()
    }

    /// Resolves once the tunnel stops being open
    pub async fn closing(&self) {
        let mut status = self.reader.status.subscribe();
        let _ = status.wait_for(|status| *status != TunnelStatus::Open).await;
    }

    /// Split into independently usable halves
    pub fn into_split(self) -> (TunnelReader, TunnelWriter) {
        (self.reader, self.writer)
    }
}

/// Inbound half
#[derive(Debug)]
pub struct TunnelReader {
    topic: TopicName,
    inbound: mpsc::Receiver<Bytes>,
    status: Arc<watch::Sender<TunnelStatus>>,
}

impl TunnelReader {
    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        match self.inbound.recv().await {
            Some(chunk) => Some(chunk),
            None => {
                self.status.send_replace(TunnelStatus::Closed);
                None
            }
        }
    }

    pub fn status(&self) -> TunnelStatus {
        *self.status.borrow()
    }
}

/// Outbound half
#[derive(Debug, Clone)]
pub struct TunnelWriter {
    topic: TopicName,
    tunnel: Weak<Tunnel>,
}

impl TunnelWriter {
    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    /// Publish outbound bytes; fails once the tunnel is closed
    pub async fn publish(&self, payload: Bytes) -> Result<PublishToken, MqtError> {
        let tunnel = self
            .tunnel
            .upgrade()
            .ok_or_else(|| TunnelError::Closed(self.topic.clone()))?;
        tunnel.publish(payload).await
    }

    /// The adapter finished with its stream; tear the tunnel down
    pub fn release(&self) {
        if let Some(tunnel) = self.tunnel.upgrade() {
            tunnel.request_release();
        }
    }
}
