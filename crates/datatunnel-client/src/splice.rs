//! Byte splice between a tunneled connection and a local service

use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUFFER_SIZE: usize = 16 * 1024;

/// Direction of one half of a splice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceDirection {
    TunnelToLocal,
    LocalToTunnel,
}

impl fmt::Display for SpliceDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpliceDirection::TunnelToLocal => f.write_str("tunnel->local"),
            SpliceDirection::LocalToTunnel => f.write_str("local->tunnel"),
        }
    }
}

/// Errors that can occur while splicing
#[derive(Debug, Error)]
pub enum SpliceError {
    #[error("IO error while copying {direction}: {source}")]
    Io {
        direction: SpliceDirection,
        source: io::Error,
    },
}

/// Outcome of a finished splice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceStats {
    /// Direction whose copy ended first and tore the splice down
    pub first_finished: SpliceDirection,
    pub bytes_to_local: u64,
    pub bytes_to_tunnel: u64,
}

/// Copy bytes both ways until either side closes
///
/// When one direction ends (EOF or error) both connections are dropped,
/// which also ends the opposite copy.
pub async fn splice<T, L>(tunnel: T, local: L) -> Result<SpliceStats, SpliceError>
where
    T: AsyncRead + AsyncWrite,
    L: AsyncRead + AsyncWrite,
{
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);
    let (mut local_read, mut local_write) = tokio::io::split(local);

    let mut bytes_to_local = 0u64;
    let mut bytes_to_tunnel = 0u64;

    let (first_finished, result) = tokio::select! {
        result = copy_counted(&mut tunnel_read, &mut local_write, &mut bytes_to_local) => {
            (SpliceDirection::TunnelToLocal, result)
        }
        result = copy_counted(&mut local_read, &mut tunnel_write, &mut bytes_to_tunnel) => {
            (SpliceDirection::LocalToTunnel, result)
        }
    };

    result.map_err(|source| SpliceError::Io {
        direction: first_finished,
        source,
    })?;

    Ok(SpliceStats {
        first_finished,
        bytes_to_local,
        bytes_to_tunnel,
    })
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        *copied += n as u64;
    }
    writer.shutdown().await
}
