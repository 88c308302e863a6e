//! Per-stream connection state

use crate::error::RpcError;
use crate::pending::PendingCalls;
use crate::registry::CallKind;
use datatunnel_proto::ControlStreamMessage;
use datatunnel_transport::{ControlChannel, MessageSink, MessageSource};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One established control stream
///
/// Cheap to clone. The send path is serialized so any number of tasks may
/// issue calls concurrently; message ids are assigned in strictly increasing
/// order starting at 1.
#[derive(Clone)]
pub struct ControlConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: String,
    peer: String,
    sink: Mutex<Box<dyn MessageSink>>,
    next_id: AtomicU64,
    pending: PendingCalls,
    closed: CancellationToken,
}

impl ControlConnection {
    pub fn new(sink: Box<dyn MessageSink>, peer: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: uuid::Uuid::new_v4().to_string(),
                peer: peer.into(),
                sink: Mutex::new(sink),
                next_id: AtomicU64::new(1),
                pending: PendingCalls::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Split a channel into a connection (sending side) and the source the
    /// read loop consumes
    pub fn from_channel(channel: ControlChannel) -> (Self, Box<dyn MessageSource>) {
        let ControlChannel { sink, source, peer } = channel;
        (Self::new(sink, peer), source)
    }

    /// Unique id of this connection, for logging
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub(crate) fn next_message_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn pending(&self) -> &PendingCalls {
        &self.inner.pending
    }

    /// Send one message on the stream
    pub async fn send(&self, message: ControlStreamMessage) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ConnectionFinished);
        }

        let mut sink = self.inner.sink.lock().await;
        sink.send(message).await?;
        Ok(())
    }

    /// Close the stream context
    ///
    /// The read loop stops and every pending call fails with
    /// [`RpcError::ConnectionFinished`].
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Number of in-flight requests awaiting a response
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.count()
    }

    /// Close the context, fail pending calls and close the sending half
    pub(crate) async fn shutdown(&self) {
        self.close();
        self.inner.pending.fail_all();

        let mut sink = self.inner.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!(connection_id = %self.inner.id, error = %e, "Error closing control stream");
        }
    }
}

impl fmt::Debug for ControlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlConnection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("pending", &self.inner.pending.count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Context handed to every server-side handler
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Connection the call arrived on; handlers may issue calls back on it
    pub connection: ControlConnection,
    pub method: String,
    /// Resolved version of the handler being invoked
    pub version: u32,
    pub kind: CallKind,
    pub message_id: u64,
}
