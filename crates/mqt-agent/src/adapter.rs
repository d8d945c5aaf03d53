//! Byte-stream adapter
//!
//! Pumps an `AsyncRead + AsyncWrite` stream through a tunnel handle in both
//! directions. When either direction finishes the tunnel is released.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use mqt_core::MqtError;

use crate::tunnel::{TunnelHandle, TunnelReader, TunnelWriter};

/// Default read size for outbound chunks
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Which side ended the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEnd {
    /// The local stream reached EOF or failed
    Stream,
    /// The tunnel closed and its queue drained
    Tunnel,
}

/// Bridge `stream` and the tunnel until one side ends
pub async fn bridge<S>(stream: S, handle: TunnelHandle, chunk_size: usize) -> BridgeEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let topic = handle.topic().clone();
    let (reader, writer) = handle.into_split();
    let (mut rd, mut wr) = tokio::io::split(stream);

    let end = tokio::select! {
        result = outbound(&mut rd, &writer, chunk_size.max(1)) => {
            if let Err(e) = result {
                tracing::debug!("Outbound pump for {} stopped: {}", topic, e);
            }
            BridgeEnd::Stream
        }
        result = inbound(reader, &mut wr) => {
            if let Err(e) = result {
                tracing::debug!("Inbound pump for {} stopped: {}", topic, e);
                BridgeEnd::Stream
            } else {
                BridgeEnd::Tunnel
            }
        }
    };

    let _ = wr.shutdown().await;
    writer.release();
    tracing::info!("Bridge for {} finished ({:?})", topic, end);
    end
}

/// Local stream -> tunnel
async fn outbound<R>(rd: &mut R, writer: &TunnelWriter, chunk_size: usize) -> Result<(), MqtError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(chunk_size);
    loop {
        buf.reserve(chunk_size);
        let n = rd.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        // Completion is reported through the token; QoS 0 never waits
        writer.publish(buf.split().freeze()).await?;
    }
}

/// Tunnel -> local stream
async fn inbound<W>(mut reader: TunnelReader, wr: &mut W) -> Result<(), MqtError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = reader.recv().await {
        wr.write_all(&chunk).await?;
        wr.flush().await?;
    }
    Ok(())
}
