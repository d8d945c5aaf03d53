//! MQTT connection manager
//!
//! Owns the client handle and the event-loop driver task. The driver is the
//! only place that polls the transport: it advances the connection state
//! machine, correlates acknowledgements and forwards publications and
//! connectivity changes to the orchestrator.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, Outgoing,
    SubscribeFilter, SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;

use mqt_core::config::AgentConfig;
use mqt_core::{BrokerClient, BrokerError, ConnectionState, MqtError, PublishToken, SubscriptionSet};
use mqt_protocol::{QualityLevel, TopicName};

use super::acks::{AckKind, AckSender, AckTracker};
use super::options::{from_qos, mqtt_options, to_qos};
use super::reconnect::FixedInterval;
use super::state::{StateCell, Transition};
use super::{BrokerEvent, InboundMessage};

/// Channel capacity for events from the driver.
///
/// When the orchestrator falls behind, the driver blocks on this channel and
/// stops reading from the broker, which pushes backpressure to the broker.
const BROKER_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Requests buffered between callers and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long close waits for the disconnect to be flushed
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the single broker session
pub struct ConnectionManager {
    client: AsyncClient,
    /// Taken by the driver on connect; a manager connects at most once
    eventloop: Mutex<Option<EventLoop>>,
    state: Arc<StateCell>,
    acks: Arc<AckTracker>,
    /// Serializes waiter registration with request submission
    requests: tokio::sync::Mutex<()>,
    events: mpsc::Sender<BrokerEvent>,
    command_timeout: Duration,
    reconnect_interval: Duration,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    address: String,
}

impl ConnectionManager {
    /// Create a manager for `config`. Nothing touches the network until
    /// [`ConnectionManager::connect`].
    pub fn new(config: &AgentConfig) -> Result<(Self, mpsc::Receiver<BrokerEvent>), MqtError> {
        let options = mqtt_options(config)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(BROKER_EVENT_CHANNEL_CAPACITY);

        let manager = Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            state: Arc::new(StateCell::new()),
            acks: Arc::new(AckTracker::new()),
            requests: tokio::sync::Mutex::new(()),
            events: events_tx,
            command_timeout: config.command_timeout,
            reconnect_interval: config.reconnect_interval,
            shutdown: CancellationToken::new(),
            driver: Mutex::new(None),
            address: format!("{}:{}", config.host, config.port),
        };

        Ok((manager, events_rx))
    }

    /// Watch connectivity changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Establish the session, waiting up to the command timeout.
    ///
    /// On failure the state returns to `Disconnected` and the manager cannot
    /// be reused.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        let eventloop = lock(&self.eventloop).take().ok_or(BrokerError::Closed)?;
        self.state
            .apply(Transition::Connect)
            .map_err(|current| BrokerError::Transport(format!("cannot connect while {}", current)))?;

        tracing::info!("Connecting to broker at {}", self.address);

        let (first_tx, first_rx) = oneshot::channel();
        let driver = Driver {
            state: Arc::clone(&self.state),
            acks: Arc::clone(&self.acks),
            events: self.events.clone(),
            reconnect: FixedInterval::new(self.reconnect_interval),
            shutdown: self.shutdown.clone(),
            address: self.address.clone(),
        };
        let handle = tokio::spawn(driver.run(eventloop, first_tx).with_current_subscriber());
        *lock(&self.driver) = Some(handle);

        let outcome = match tokio::time::timeout(self.command_timeout, first_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::Closed),
            Err(_) => Err(BrokerError::Timeout {
                operation: "connect",
            }),
        };

        if let Err(e) = &outcome {
            tracing::error!("Failed to connect to broker at {}: {}", self.address, e);
            self.shutdown.cancel();
            self.join_driver().await;
            self.state.reset();
        }
        outcome
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.state.get().is_terminal() {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    /// Register `waiter` and hand one request to the client.
    ///
    /// The request lock and the client's request channel can each hold a
    /// caller for as long as the broker is unreachable, so with a deadline
    /// both waits count against it. A waiter whose request never reached the
    /// client is withdrawn, including when the caller is cancelled.
    async fn submit<F>(
        &self,
        kind: AckKind,
        waiter: AckSender,
        resolve_on_send: bool,
        deadline: Option<Instant>,
        operation: &'static str,
        request: F,
    ) -> Result<(), BrokerError>
    where
        F: Future<Output = Result<(), ClientError>>,
    {
        let timed_out = || BrokerError::Timeout { operation };
        let _guard = within(deadline, self.requests.lock())
            .await
            .ok_or_else(timed_out)?;

        self.acks.enqueue(kind, waiter, resolve_on_send);
        let mut registered = Registered {
            acks: &self.acks,
            kind,
            armed: true,
        };
        match within(deadline, request).await {
            Some(Ok(())) => {
                registered.armed = false;
                Ok(())
            }
            Some(Err(e)) => Err(BrokerError::Transport(e.to_string())),
            None => Err(timed_out()),
        }
    }

    async fn await_ack(
        &self,
        rx: oneshot::Receiver<Result<(), BrokerError>>,
        deadline: Instant,
        operation: &'static str,
    ) -> Result<(), BrokerError> {
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::Closed),
            Err(_) => Err(BrokerError::Timeout { operation }),
        }
    }

    async fn join_driver(&self) {
        let handle = lock(&self.driver).take();
        let Some(mut handle) = handle else {
            return;
        };
        if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
            self.shutdown.cancel();
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl BrokerClient for ConnectionManager {
    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn subscribe(&self, topics: &SubscriptionSet) -> Result<(), BrokerError> {
        if topics.is_empty() {
            return Ok(());
        }
        self.ensure_open()?;

        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .map(|(topic, quality)| SubscribeFilter::new(topic.to_string(), to_qos(*quality)))
            .collect();

        let deadline = Instant::now() + self.command_timeout;
        let (tx, rx) = oneshot::channel();
        let request = self.client.subscribe_many(filters);
        self.submit(AckKind::Subscribe, tx, false, Some(deadline), "subscribe", request)
            .await?;

        tracing::debug!("Subscribing to {} topics", topics.len());
        self.await_ack(rx, deadline, "subscribe").await
    }

    async fn unsubscribe(&self, topic: &TopicName) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let deadline = Instant::now() + self.command_timeout;
        let (tx, rx) = oneshot::channel();
        let request = self.client.unsubscribe(topic.to_string());
        self.submit(AckKind::Unsubscribe, tx, false, Some(deadline), "unsubscribe", request)
            .await?;

        self.await_ack(rx, deadline, "unsubscribe").await
    }

    async fn publish(
        &self,
        topic: &TopicName,
        quality: QualityLevel,
        retained: bool,
        payload: Bytes,
    ) -> Result<PublishToken, BrokerError> {
        self.ensure_open()?;

        // Waits for room in the request queue without a bound; that wait is
        // the backpressure adapters see while the link is down.
        let (tx, token) = PublishToken::pending();
        let request = self
            .client
            .publish_bytes(topic.to_string(), to_qos(quality), retained, payload);
        self.submit(AckKind::Publish, tx, !quality.is_acknowledged(), None, "publish", request)
            .await?;

        Ok(token)
    }

    async fn close(&self) {
        if self.state.apply(Transition::Close).is_err() {
            return;
        }

        let _ = tokio::time::timeout(DISCONNECT_GRACE, self.client.disconnect()).await;
        self.join_driver().await;
        self.acks.close();
        tracing::info!("Broker session closed");
    }
}

/// Withdraws the most recent waiter on drop unless disarmed
struct Registered<'a> {
    acks: &'a AckTracker,
    kind: AckKind,
    armed: bool,
}

impl Drop for Registered<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.acks.withdraw_last(self.kind);
        }
    }
}

/// Run `future`, giving up at `deadline` when there is one
async fn within<F: Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

/// Background task polling the client event loop
struct Driver {
    state: Arc<StateCell>,
    acks: Arc<AckTracker>,
    events: mpsc::Sender<BrokerEvent>,
    reconnect: FixedInterval,
    shutdown: CancellationToken,
    address: String,
}

type FirstConnect = Option<oneshot::Sender<Result<(), BrokerError>>>;

impl Driver {
    async fn run(mut self, mut eventloop: EventLoop, first: oneshot::Sender<Result<(), BrokerError>>) {
        let mut first: FirstConnect = Some(first);

        loop {
            let polled = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                polled = eventloop.poll() => polled,
            };

            match polled {
                Ok(Event::Incoming(packet)) => self.on_incoming(packet, &mut first).await,
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::debug!("Disconnect sent to broker");
                    break;
                }
                Ok(Event::Outgoing(outgoing)) => self.on_outgoing(outgoing),
                Err(err) => {
                    if let Some(first) = first.take() {
                        let _ = self.state.apply(Transition::Failed);
                        let _ = first.send(Err(classify(&err)));
                        break;
                    }
                    if self.shutdown.is_cancelled() || self.state.get().is_terminal() {
                        break;
                    }

                    self.on_connection_error(&err).await;

                    let delay = self.reconnect.next_delay();
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::debug!("Broker driver stopped");
    }

    async fn on_incoming(&mut self, packet: Incoming, first: &mut FirstConnect) {
        match packet {
            Incoming::ConnAck(ack) => {
                if ack.code != ConnectReturnCode::Success {
                    let error = BrokerError::ConnectionRefused(format!("{:?}", ack.code));
                    tracing::warn!("Broker rejected session: {}", error);
                    if let Some(first) = first.take() {
                        let _ = self.state.apply(Transition::Failed);
                        let _ = first.send(Err(error));
                        self.shutdown.cancel();
                    }
                    return;
                }

                let resumed = self.state.get() == ConnectionState::Reconnecting;
                let _ = self.state.apply(Transition::Established);
                self.reconnect.reset();
                if let Some(first) = first.take() {
                    let _ = first.send(Ok(()));
                }

                if resumed {
                    tracing::info!("Reconnected to broker at {}", self.address);
                } else {
                    tracing::info!(
                        session_present = ack.session_present,
                        "Connected to broker at {}",
                        self.address
                    );
                }
                self.emit(BrokerEvent::Connected { resumed }).await;
            }
            Incoming::Publish(publish) => {
                let message = InboundMessage {
                    topic: TopicName::from(publish.topic),
                    payload: publish.payload,
                    quality: from_qos(publish.qos),
                };
                self.emit(BrokerEvent::Message(message)).await;
            }
            Incoming::SubAck(ack) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                let result = if rejected {
                    Err(BrokerError::SubscriptionRejected(format!("packet {}", ack.pkid)))
                } else {
                    Ok(())
                };
                self.acks.on_ack(AckKind::Subscribe, ack.pkid, result);
            }
            Incoming::UnsubAck(ack) => self.acks.on_ack(AckKind::Unsubscribe, ack.pkid, Ok(())),
            Incoming::PubAck(ack) => self.acks.on_ack(AckKind::Publish, ack.pkid, Ok(())),
            Incoming::PubComp(comp) => self.acks.on_ack(AckKind::Publish, comp.pkid, Ok(())),
            _ => {}
        }
    }

    fn on_outgoing(&self, outgoing: Outgoing) {
        match outgoing {
            Outgoing::Subscribe(pkid) => self.acks.on_outgoing(AckKind::Subscribe, pkid),
            Outgoing::Unsubscribe(pkid) => self.acks.on_outgoing(AckKind::Unsubscribe, pkid),
            Outgoing::Publish(pkid) => self.acks.on_outgoing(AckKind::Publish, pkid),
            Outgoing::AwaitAck(pkid) => self.acks.on_await_ack(AckKind::Publish, pkid),
            _ => {}
        }
    }

    async fn on_connection_error(&mut self, err: &ConnectionError) {
        match self.state.apply(Transition::Lost) {
            Ok(_) => {
                let reason = err.to_string();
                tracing::warn!("Connection to broker lost: {}", reason);
                self.acks.connection_lost(&reason);
                self.emit(BrokerEvent::ConnectionLost { reason }).await;
            }
            Err(_) => {
                let _ = self.state.apply(Transition::Failed);
                tracing::warn!(
                    "Reconnect attempt {} to {} failed: {}",
                    self.reconnect.attempts(),
                    self.address,
                    err
                );
            }
        }
    }

    async fn emit(&self, event: BrokerEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Broker event receiver dropped");
        }
    }
}

fn classify(err: &ConnectionError) -> BrokerError {
    match err {
        ConnectionError::ConnectionRefused(code) => BrokerError::ConnectionRefused(format!("{:?}", code)),
        other => BrokerError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(port: u16) -> AgentConfig {
        AgentConfig {
            host: "127.0.0.1".into(),
            port,
            ignore_tls_errors: true,
            command_timeout: Duration::from_secs(2),
            ..AgentConfig::default()
        }
        .prepare(None)
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_refused_is_fatal_and_resets_state() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (manager, _events) = ConnectionManager::new(&config_for(port)).unwrap();
        assert!(manager.connect().await.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // The event loop was consumed by the failed attempt
        assert!(matches!(manager.connect().await, Err(BrokerError::Closed)));
    }

    #[tokio::test]
    async fn test_connect_times_out_against_silent_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut config = config_for(port);
        config.command_timeout = Duration::from_millis(300);
        let (manager, _events) = ConnectionManager::new(&config).unwrap();

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, BrokerError::Timeout { operation: "connect" }));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_closed_manager_rejects_requests() {
        let (manager, _events) = ConnectionManager::new(&config_for(1883)).unwrap();
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Closed);

        let topic = TopicName::from("t/a");
        assert!(matches!(manager.unsubscribe(&topic).await, Err(BrokerError::Closed)));
        assert!(matches!(
            manager
                .publish(&topic, QualityLevel::AtMostOnce, false, Bytes::from_static(b"x"))
                .await,
            Err(BrokerError::Closed)
        ));
    }
}
