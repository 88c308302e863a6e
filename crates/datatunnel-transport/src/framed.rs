//! Control stream over any byte stream
//!
//! Messages are framed with [`ControlCodec`] (`length: u32 BE | bincode`).

use crate::{
    ControlChannel, ControlConnector, MessageSink, MessageSource, TransportError, TransportResult,
};
use async_trait::async_trait;
use datatunnel_proto::{ControlCodec, ControlStreamMessage};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

/// Sending half of a framed control stream
pub struct FramedSink<W> {
    inner: FramedWrite<W, ControlCodec>,
    closed: bool,
}

impl<W> fmt::Debug for FramedSink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedSink")
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl<W> MessageSink for FramedSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: ControlStreamMessage) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }

        trace!(id = message.id(), method = %message.method(), "Sending control message");
        self.inner.send(message).await?;
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.close().await?;
        Ok(())
    }
}

/// Receiving half of a framed control stream
pub struct FramedSource<R> {
    inner: FramedRead<R, ControlCodec>,
}

impl<R> fmt::Debug for FramedSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl<R> MessageSource for FramedSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv(&mut self) -> TransportResult<Option<ControlStreamMessage>> {
        match self.inner.next().await {
            Some(Ok(message)) => {
                trace!(id = message.id(), method = %message.method(), "Received control message");
                Ok(Some(message))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

/// Wrap a byte stream as a control channel
pub fn framed<T>(io: T, peer: impl Into<String>) -> ControlChannel
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer): (ReadHalf<T>, WriteHalf<T>) = tokio::io::split(io);

    ControlChannel {
        sink: Box::new(FramedSink {
            inner: FramedWrite::new(writer, ControlCodec),
            closed: false,
        }),
        source: Box::new(FramedSource {
            inner: FramedRead::new(reader, ControlCodec),
        }),
        peer: peer.into(),
    }
}

/// Two connected control channels backed by an in-memory pipe
pub fn in_memory_pair(buffer_size: usize) -> (ControlChannel, ControlChannel) {
    let (a, b) = tokio::io::duplex(buffer_size);
    (framed(a, "memory:a"), framed(b, "memory:b"))
}

/// Dials control streams over plain TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl ControlConnector for TcpConnector {
    async fn connect(&self, target: &str) -> TransportResult<ControlChannel> {
        debug!(target_addr = %target, "Dialing control stream");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionError(format!("{}: {}", target, e)))?;
        stream.set_nodelay(true)?;

        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| target.to_string());

        Ok(framed(stream, peer))
    }
}
