//! Boundary entry points
//!
//! Both entry points take a configuration source, an optional control topic
//! override and a numeric log-level selector, run a session to completion
//! and report a plain status code: [`STATUS_OK`] or [`STATUS_FAILURE`].
//! Logging is scoped to the call; no global subscriber is installed.

use std::future::Future;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;

use mqt_agent::SessionOrchestrator;
use mqt_core::config::{AgentConfig, ConfigSource};
use mqt_core::logging::{self, LogLevel};

use crate::endpoint;

pub const STATUS_OK: i32 = 0;
pub const STATUS_FAILURE: i32 = -1;

/// Serve tunnels opened by peers until interrupted.
///
/// This is the static 0/0 mode: only the control topic is subscribed and
/// every peer-opened tunnel is bridged to the address its open packet hints.
pub fn start_tunnel(source: &ConfigSource, control: Option<&str>, log_level: i32) -> i32 {
    run_session(source, control, log_level, serve_peers)
}

/// Run one static tunnel between `127.0.0.1:local` and the peer's `remote`
/// port. Returns once the bridged connection ends or on interrupt.
pub fn connect_tunnel(
    source: &ConfigSource,
    control: Option<&str>,
    local: u16,
    remote: u16,
    log_level: i32,
) -> i32 {
    run_session(source, control, log_level, move |config, shutdown| {
        serve_static(config, local, remote, shutdown)
    })
}

fn run_session<F, Fut>(source: &ConfigSource, control: Option<&str>, log_level: i32, session: F) -> i32
where
    F: FnOnce(AgentConfig, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let dispatch = logging::dispatch(LogLevel::from_selector(log_level));

    tracing::dispatcher::with_default(&dispatch, || {
        match execute(source, control, session) {
            Ok(()) => STATUS_OK,
            Err(e) => {
                tracing::error!("{:#}", e);
                STATUS_FAILURE
            }
        }
    })
}

fn execute<F, Fut>(source: &ConfigSource, control: Option<&str>, session: F) -> Result<()>
where
    F: FnOnce(AgentConfig, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let config = load(source, control)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        let shutdown = CancellationToken::new();
        let interrupt = shutdown.clone();
        tokio::spawn(
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupted, shutting down");
                    interrupt.cancel();
                }
            }
            .with_current_subscriber(),
        );

        session(config, shutdown).await
    })
}

/// Load, apply the control override and validate
pub fn load(source: &ConfigSource, control: Option<&str>) -> Result<AgentConfig> {
    let config: AgentConfig = source.load().context("Failed to load configuration")?;
    let config = config.prepare(control).context("Invalid configuration")?;
    tracing::info!(
        "Broker {}:{} ({}), control topic {}, client {}",
        config.host,
        config.port,
        config.transport_mode(),
        config.control,
        config.client_id()
    );
    Ok(config)
}

async fn serve_peers(config: AgentConfig, shutdown: CancellationToken) -> Result<()> {
    let mut orchestrator = SessionOrchestrator::connect(&config)
        .await
        .context("Failed to connect to broker")?;
    let opened = orchestrator
        .take_opened()
        .context("Opened-tunnel receiver already taken")?;

    let endpoints = tokio::spawn(endpoint::serve_opened(opened).with_current_subscriber());
    let result = orchestrator.run(shutdown).await;
    if let Err(e) = endpoints.await {
        tracing::warn!("Endpoint task failed: {}", e);
    }

    result.context("Broker session failed")
}

async fn serve_static(
    config: AgentConfig,
    local: u16,
    remote: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = endpoint::bind_local(local).await?;
    let orchestrator = SessionOrchestrator::connect(&config)
        .await
        .context("Failed to connect to broker")?;
    let handle = orchestrator
        .open_static(local, remote)
        .await
        .context("Failed to open tunnel")?;
    tracing::info!("Tunnel {} ready on 127.0.0.1:{}", handle.topic(), local);

    let session = shutdown.child_token();
    let mut run = tokio::spawn(orchestrator.run(session.clone()).with_current_subscriber());

    let bridged = tokio::select! {
        finished = &mut run => {
            finished.context("Session task failed")?.context("Broker session failed")?;
            return Ok(());
        }
        end = endpoint::accept_and_bridge(listener, handle) => end.map(|end| {
            tracing::info!("Static tunnel finished ({:?})", end);
        }),
        _ = session.cancelled() => Ok(()),
    };

    session.cancel();
    run.await
        .context("Session task failed")?
        .context("Broker session failed")?;
    bridged
}
