//! Dialing tunneled connections and local services

use crate::error::ClientError;
use crate::services::ProxyService;
use bytes::Bytes;
use datatunnel_proto::{write_handshake, Handshake};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

async fn connect(address: &str, timeout: Duration) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Open a raw connection to the tunnel rendezvous and present `key`
///
/// On success the stream is positioned right after the handshake and carries
/// application bytes only.
pub async fn dial_tunnel(
    address: &str,
    key: &Bytes,
    timeout: Duration,
) -> Result<TcpStream, ClientError> {
    let mut stream = connect(address, timeout)
        .await
        .map_err(|source| ClientError::TunnelDial {
            address: address.to_string(),
            source,
        })?;

    write_handshake(&mut stream, &Handshake::with_key(key.clone())).await?;
    debug!(address = %address, "Tunnel handshake sent");

    Ok(stream)
}

/// Connect to a local service
pub async fn dial_local(service: &ProxyService, timeout: Duration) -> Result<TcpStream, ClientError> {
    let address = service.address();
    connect(&address, timeout)
        .await
        .map_err(|source| ClientError::LocalDial { address, source })
}
