//! Broker client trait

use async_trait::async_trait;
use bytes::Bytes;
use mqt_protocol::{QualityLevel, TopicName};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::BrokerError;
use crate::types::ConnectionState;

/// Full set of topics to subscribe in one request, with their quality
pub type SubscriptionSet = BTreeMap<TopicName, QualityLevel>;

/// Completion handle for a publish.
///
/// Resolves once the broker acknowledged the message (QoS 1 and 2) or once it
/// was handed to the network (QoS 0).
#[derive(Debug)]
pub struct PublishToken {
    rx: oneshot::Receiver<Result<(), BrokerError>>,
}

impl PublishToken {
    /// Create a token and the sender that completes it
    pub fn pending() -> (oneshot::Sender<Result<(), BrokerError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A token that is already complete
    pub fn completed(result: Result<(), BrokerError>) -> Self {
        let (tx, token) = Self::pending();
        let _ = tx.send(result);
        token
    }

    /// Wait for completion
    pub async fn wait(self) -> Result<(), BrokerError> {
        self.rx.await.unwrap_or(Err(BrokerError::Closed))
    }

    /// Wait for completion, giving up after `timeout`
    pub async fn wait_timeout(self, timeout: Duration) -> Result<(), BrokerError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout {
                operation: "publish",
            }),
        }
    }
}

/// Abstraction over the single broker session.
///
/// Implemented by the MQTT connection manager; tests substitute an in-memory
/// broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Current connectivity state
    fn state(&self) -> ConnectionState;

    /// Subscribe to every topic in `topics` with one request and wait for
    /// the acknowledgement
    async fn subscribe(&self, topics: &SubscriptionSet) -> Result<(), BrokerError>;

    /// Unsubscribe from `topic` and wait for the acknowledgement
    async fn unsubscribe(&self, topic: &TopicName) -> Result<(), BrokerError>;

    /// Enqueue a publication; completion is reported through the token
    async fn publish(
        &self,
        topic: &TopicName,
        quality: QualityLevel,
        retained: bool,
        payload: Bytes,
    ) -> Result<PublishToken, BrokerError>;

    /// Close the session. Terminal.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completed_token_resolves() {
        assert!(PublishToken::completed(Ok(())).wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_sender_reports_closed() {
        let (tx, token) = PublishToken::pending();
        drop(tx);
        assert!(matches!(token.wait().await, Err(BrokerError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_expires() {
        let (_tx, token) = PublishToken::pending();
        let result = token.wait_timeout(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(BrokerError::Timeout { operation: "publish" })));
    }
}
