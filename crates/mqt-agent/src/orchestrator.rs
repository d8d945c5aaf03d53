//! Session orchestrator
//!
//! Wires the connection manager, topic router and control handler together
//! and runs until cancelled. Broker events are consumed by the run-loop;
//! every registry mutation (control commands, reconnect re-subscription,
//! adapter releases) goes through one registry worker task so they are
//! applied one at a time and in arrival order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;

use mqt_core::config::AgentConfig;
use mqt_core::{BrokerClient, BrokerError, MqtError, TunnelError};
use mqt_protocol::{ControlCommand, OpenParams, OpenTunnel, QualityLevel, TopicName};

use crate::broker::{BrokerEvent, ConnectionManager};
use crate::control::{ControlHandler, ControlOutcome, OpenedTunnel};
use crate::router::{Dispatch, RouterSettings, TopicRouter};
use crate::tunnel::{TunnelHandle, TunnelSpec};

/// How long the registry worker may take to finish after cancellation
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

const SESSION_EVENT_CAPACITY: usize = 64;
const REGISTRY_COMMAND_CAPACITY: usize = 64;
const OPENED_TUNNEL_CAPACITY: usize = 32;

/// Observable session activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { resumed: bool },
    /// `consecutive` counts losses since the last successful connect
    ConnectionLost { reason: String, consecutive: u32 },
    TunnelOpened { topic: TopicName },
    TunnelClosed { topic: TopicName },
}

/// Work for the registry worker
#[derive(Debug)]
enum RegistryCommand {
    Control(ControlCommand),
    Resubscribe,
}

pub struct SessionOrchestrator {
    client_id: String,
    quality: QualityLevel,
    command_timeout: Duration,
    broker: Arc<dyn BrokerClient>,
    events: mpsc::Receiver<BrokerEvent>,
    router: Arc<TopicRouter>,
    control: Arc<ControlHandler>,
    release_rx: mpsc::UnboundedReceiver<TopicName>,
    opened_tx: mpsc::Sender<OpenedTunnel>,
    opened_rx: Option<mpsc::Receiver<OpenedTunnel>>,
    session_events: broadcast::Sender<SessionEvent>,
}

impl SessionOrchestrator {
    /// Build an orchestrator around an already connected broker client.
    ///
    /// `config` must have been through [`AgentConfig::prepare`].
    pub fn new(
        config: &AgentConfig,
        broker: Arc<dyn BrokerClient>,
        events: mpsc::Receiver<BrokerEvent>,
    ) -> Result<Self, MqtError> {
        let control_topic = config.control_topic()?;
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let router = Arc::new(
            TopicRouter::new(control_topic, Arc::clone(&broker), RouterSettings::from(config))
                .with_release_channel(release_tx),
        );
        let control = Arc::new(ControlHandler::new(
            config.client_id(),
            config.tunnel_quality,
            Arc::clone(&router),
        ));
        let (opened_tx, opened_rx) = mpsc::channel(OPENED_TUNNEL_CAPACITY);
        let (session_events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);

        Ok(Self {
            client_id: config.client_id().to_string(),
            quality: config.tunnel_quality,
            command_timeout: config.command_timeout,
            broker,
            events,
            router,
            control,
            release_rx,
            opened_tx,
            opened_rx: Some(opened_rx),
            session_events,
        })
    }

    /// Connect to the broker described by `config` and subscribe the
    /// control topic. Any failure here is fatal.
    pub async fn connect(config: &AgentConfig) -> Result<Self, MqtError> {
        let (manager, events) = ConnectionManager::new(config)?;
        manager.connect().await?;

        let orchestrator = Self::new(config, Arc::new(manager), events)?;
        if let Err(e) = orchestrator.router.resubscribe_all().await {
            orchestrator.broker.close().await;
            return Err(e.into());
        }
        Ok(orchestrator)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    pub fn control(&self) -> &Arc<ControlHandler> {
        &self.control
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_events.subscribe()
    }

    /// Tunnels opened by peers. Only the first call returns the receiver.
    ///
    /// Call this before [`SessionOrchestrator::run`] to serve peer tunnels.
    /// A session whose receiver was never taken has no adapter for them and
    /// ignores every open request it sees on the control topic.
    pub fn take_opened(&mut self) -> Option<mpsc::Receiver<OpenedTunnel>> {
        self.opened_rx.take()
    }

    /// Register the static tunnel for `local`/`remote` and ask the peer to
    /// provision its half.
    ///
    /// This side subscribes on `<control>/<client id>/<local>-<remote>/a` and
    /// publishes to the matching `/b` topic; the announced open packet has
    /// the two swapped.
    pub async fn open_static(&self, local: u16, remote: u16) -> Result<TunnelHandle, MqtError> {
        let base = self
            .router
            .control_topic()
            .child(&self.client_id)
            .child(format!("{}-{}", local, remote));
        let topic = TopicName::parse(base.child("a").as_str())?;
        let peer_topic = TopicName::parse(base.child("b").as_str())?;

        let spec = TunnelSpec::new(topic.clone(), self.quality).with_peer(peer_topic.clone());
        let outcome = self.router.open(spec).await?;
        if !outcome.is_created() {
            return Err(TunnelError::AlreadyOpen(topic).into());
        }
        let handle = outcome
            .tunnel()
            .take_handle()
            .ok_or_else(|| TunnelError::Closed(topic.clone()))?;

        let announce = OpenTunnel {
            topic: peer_topic,
            quality: Some(self.quality),
            params: OpenParams {
                peer_topic: Some(topic.clone()),
                local: Some(local),
                remote: Some(remote),
                ..OpenParams::default()
            },
        };
        let token = self.control.announce(announce).await?;
        token.wait_timeout(self.command_timeout).await?;

        let _ = self.session_events.send(SessionEvent::TunnelOpened { topic });
        Ok(handle)
    }

    /// Run until `shutdown` is cancelled or the broker session ends.
    ///
    /// On cancellation inbound messages stop being read, every tunnel is
    /// closed, the registry worker gets a short grace period and the broker
    /// session is closed.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), MqtError> {
        let opened = match self.opened_rx.take() {
            Some(_) => {
                tracing::debug!("No consumer for peer tunnels, open requests will be ignored");
                None
            }
            None => Some(self.opened_tx.clone()),
        };

        let (command_tx, command_rx) = mpsc::channel(REGISTRY_COMMAND_CAPACITY);
        let worker = RegistryWorker {
            control: Arc::clone(&self.control),
            commands: command_rx,
            releases: self.release_rx,
            opened,
            session_events: self.session_events.clone(),
        };
        let worker = tokio::spawn(worker.run().with_current_subscriber());

        let mut consecutive_losses: u32 = 0;
        let result = loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                event = self.events.recv() => event,
            };

            let Some(event) = event else {
                tracing::error!("Broker session ended");
                break Err(BrokerError::Closed.into());
            };

            match event {
                BrokerEvent::Message(message) => {
                    let dispatched = tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        dispatched = self.router.dispatch(message) => dispatched,
                    };
                    if let Dispatch::Control(command) = dispatched {
                        if command_tx.send(RegistryCommand::Control(command)).await.is_err() {
                            break Err(BrokerError::Closed.into());
                        }
                    }
                }
                BrokerEvent::Connected { resumed } => {
                    consecutive_losses = 0;
                    tracing::info!("Broker session established (resumed: {})", resumed);
                    if resumed && command_tx.send(RegistryCommand::Resubscribe).await.is_err() {
                        break Err(BrokerError::Closed.into());
                    }
                    let _ = self.session_events.send(SessionEvent::Connected { resumed });
                }
                BrokerEvent::ConnectionLost { reason } => {
                    consecutive_losses = consecutive_losses.saturating_add(1);
                    tracing::warn!(
                        "Connection lost ({} in a row): {}",
                        consecutive_losses,
                        reason
                    );
                    let _ = self.session_events.send(SessionEvent::ConnectionLost {
                        reason,
                        consecutive: consecutive_losses,
                    });
                }
            }
        };

        drop(command_tx);
        let closed = self.router.close_all().await;
        tracing::info!("Shutting down, closed {} tunnel(s)", closed);

        match tokio::time::timeout(SHUTDOWN_GRACE, worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Registry worker failed: {}", e),
            Err(_) => tracing::warn!("Registry worker did not finish within the grace period"),
        }

        self.broker.close().await;
        result
    }
}

/// Single consumer of every registry mutation
struct RegistryWorker {
    control: Arc<ControlHandler>,
    commands: mpsc::Receiver<RegistryCommand>,
    releases: mpsc::UnboundedReceiver<TopicName>,
    /// `None` when this session does not serve peer tunnels
    opened: Option<mpsc::Sender<OpenedTunnel>>,
    session_events: broadcast::Sender<SessionEvent>,
}

impl RegistryWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(RegistryCommand::Control(command)) => self.on_control(command).await,
                    Some(RegistryCommand::Resubscribe) => {
                        if let Err(e) = self.control.router().resubscribe_all().await {
                            tracing::warn!("Failed to restore subscriptions: {}", e);
                        }
                    }
                    None => break,
                },
                Some(topic) = self.releases.recv() => self.on_release(topic).await,
            }
        }
    }

    async fn on_control(&self, command: ControlCommand) {
        if let (None, ControlCommand::Open(open)) = (&self.opened, &command) {
            tracing::debug!("Ignoring open for {}, this session serves no peer tunnels", open.topic);
            return;
        }

        match self.control.apply(command).await {
            ControlOutcome::Opened(opened) => {
                let topic = opened.handle.topic().clone();
                let _ = self.session_events.send(SessionEvent::TunnelOpened {
                    topic: topic.clone(),
                });
                let handed_over = match &self.opened {
                    Some(adapters) => adapters.try_send(opened).map_err(|e| e.to_string()),
                    None => Err("no consumer".to_string()),
                };
                if let Err(e) = handed_over {
                    tracing::warn!("No adapter available for {}: {}", topic, e);
                    self.on_release(topic).await;
                }
            }
            ControlOutcome::Closed(topic) => {
                let _ = self.session_events.send(SessionEvent::TunnelClosed { topic });
            }
            ControlOutcome::AlreadyOpen(topic) => {
                tracing::debug!("Open for {} ignored, already registered", topic);
            }
            ControlOutcome::NotRegistered(topic) => {
                tracing::debug!("Close for {} ignored, not registered", topic);
            }
            ControlOutcome::Ignored | ControlOutcome::Failed(_) => {}
        }
    }

    async fn on_release(&self, topic: TopicName) {
        match self.control.release(&topic).await {
            Ok(true) => {
                let _ = self.session_events.send(SessionEvent::TunnelClosed { topic });
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to release {}: {}", topic, e),
        }
    }
}
