//! TCP endpoints for tunnels
//!
//! The initiating side listens on a local port and bridges the accepted
//! connection; the receiving side dials the address hinted in the open
//! packet.

use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::instrument::WithSubscriber;

use mqt_agent::adapter::DEFAULT_CHUNK_SIZE;
use mqt_agent::{bridge, BridgeEnd, OpenedTunnel, TunnelHandle};

/// Host dialled when an open packet carries no host hint
pub const DEFAULT_DIAL_HOST: &str = "127.0.0.1";

/// Bind the loopback listener for a static tunnel
pub async fn bind_local(port: u16) -> Result<TcpListener> {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .with_context(|| format!("Failed to listen on 127.0.0.1:{}", port))
}

/// Accept one connection and bridge it through `handle`.
///
/// Returns early if the tunnel closes before anyone connects.
pub async fn accept_and_bridge(listener: TcpListener, handle: TunnelHandle) -> Result<BridgeEnd> {
    let accepted = tokio::select! {
        accepted = listener.accept() => accepted,
        _ = handle.closing() => {
            tracing::info!("Tunnel {} closed before a connection arrived", handle.topic());
            return Ok(BridgeEnd::Tunnel);
        }
    };

    let (stream, peer) = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
            handle.release();
            return Err(e).context("Failed to accept local connection");
        }
    };
    tracing::info!("Accepted {} for tunnel {}", peer, handle.topic());
    let _ = stream.set_nodelay(true);

    Ok(bridge(stream, handle, DEFAULT_CHUNK_SIZE).await)
}

/// Dial the hinted address for one peer-opened tunnel and bridge it
pub async fn dial_and_bridge(opened: OpenedTunnel) -> Result<BridgeEnd> {
    let OpenedTunnel { handle, params } = opened;

    let Some(port) = params.remote else {
        handle.release();
        anyhow::bail!("Open for {} carries no remote port", handle.topic());
    };
    let host = params.host.as_deref().unwrap_or(DEFAULT_DIAL_HOST);

    let stream = match TcpStream::connect((host, port)).await {
        Ok(stream) => stream,
        Err(e) => {
            handle.release();
            return Err(e).with_context(|| format!("Failed to connect to {}:{}", host, port));
        }
    };
    tracing::info!("Connected {}:{} for tunnel {}", host, port, handle.topic());
    let _ = stream.set_nodelay(true);

    Ok(bridge(stream, handle, DEFAULT_CHUNK_SIZE).await)
}

/// Serve every tunnel peers open until the orchestrator stops
pub async fn serve_opened(mut opened: mpsc::Receiver<OpenedTunnel>) {
    let mut bridges = JoinSet::new();

    loop {
        tokio::select! {
            next = opened.recv() => match next {
                Some(tunnel) => {
                    bridges.spawn(dial_and_bridge(tunnel).with_current_subscriber());
                }
                None => break,
            },
            Some(finished) = bridges.join_next() => log_bridge(finished),
        }
    }

    while let Some(finished) = bridges.join_next().await {
        log_bridge(finished);
    }
}

fn log_bridge(finished: std::result::Result<Result<BridgeEnd>, tokio::task::JoinError>) {
    match finished {
        Ok(Ok(end)) => tracing::debug!("Bridge ended ({:?})", end),
        Ok(Err(e)) => tracing::warn!("{:#}", e),
        Err(e) => tracing::warn!("Bridge task failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqt_protocol::OpenParams;

    #[tokio::test]
    async fn test_bind_local_reports_port_in_use() {
        let first = bind_local(0).await.unwrap();
        let port = first.local_addr().unwrap().port();

        let err = bind_local(port).await.unwrap_err();
        assert!(err.to_string().contains(&port.to_string()));
    }

    #[test]
    fn test_default_dial_host_is_loopback() {
        let params = OpenParams::default();
        assert_eq!(params.host.as_deref().unwrap_or(DEFAULT_DIAL_HOST), "127.0.0.1");
    }
}
