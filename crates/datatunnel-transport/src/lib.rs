//! Duplex message-stream abstraction for the control stream
//!
//! The RPC engine never touches sockets directly. It is handed one
//! [`ControlChannel`]: a sending half and a receiving half that carry whole
//! [`ControlStreamMessage`]s. Any transport able to move those messages in
//! both directions can back a channel.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        datatunnel-control (ControlBase)       │
//! └──────────────────────────────────────────────┘
//!                       │ MessageSink / MessageSource
//!                       ↓
//! ┌──────────────────────────────────────────────┐
//! │  datatunnel-transport (this crate)            │
//! │  - framed: length-prefixed bincode over any   │
//! │    AsyncRead + AsyncWrite (TCP, duplex pipe)  │
//! └──────────────────────────────────────────────┘
//! ```

pub mod framed;

use async_trait::async_trait;
use datatunnel_proto::{CodecError, ControlStreamMessage};
use std::fmt::Debug;
use thiserror::Error;

pub use framed::{framed, in_memory_pair, TcpConnector};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Timeout")]
    Timeout,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Sending half of a control stream
///
/// Only one writer may use a sink at a time; callers sharing a sink across
/// tasks serialize access themselves.
#[async_trait]
pub trait MessageSink: Send + Debug {
    /// Send one message
    async fn send(&mut self, message: ControlStreamMessage) -> TransportResult<()>;

    /// Close the sending side; the peer observes end of stream
    async fn close(&mut self) -> TransportResult<()>;
}

/// Receiving half of a control stream
#[async_trait]
pub trait MessageSource: Send + Debug {
    /// Receive the next message
    ///
    /// Returns `None` once the peer has closed the stream gracefully.
    async fn recv(&mut self) -> TransportResult<Option<ControlStreamMessage>>;
}

/// An established control stream, split into its two halves
#[derive(Debug)]
pub struct ControlChannel {
    pub sink: Box<dyn MessageSink>,
    pub source: Box<dyn MessageSource>,
    /// Human-readable peer identity for logging
    pub peer: String,
}

/// Client-side: dials a control stream to a proxy manager
#[async_trait]
pub trait ControlConnector: Send + Sync + Debug {
    /// Connect to `target` (usually `host:port`)
    async fn connect(&self, target: &str) -> TransportResult<ControlChannel>;
}
