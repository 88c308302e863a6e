//! Typed stubs for calling remote methods

use crate::connection::ControlConnection;
use crate::error::{ProtocolError, RpcError};
use crate::registry::CallKind;
use datatunnel_proto::{ArgList, ControlStreamMessage};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Caller for one remote method version
///
/// `A` is the argument tuple and `R` the return tuple, matching the shape
/// given to [`register_client_method`](crate::ControlBaseBuilder::register_client_method).
pub struct RemoteCaller<A, R> {
    method: Arc<str>,
    version: u32,
    kind: CallKind,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for RemoteCaller<A, R> {
    fn clone(&self) -> Self {
        Self {
            method: self.method.clone(),
            version: self.version,
            kind: self.kind,
            _marker: PhantomData,
        }
    }
}

impl<A, R> fmt::Debug for RemoteCaller<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCaller")
            .field("method", &self.method)
            .field("version", &self.version)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<A: ArgList, R: ArgList> RemoteCaller<A, R> {
    pub(crate) fn new(method: &str, version: u32, kind: CallKind) -> Self {
        Self {
            method: Arc::from(method),
            version,
            kind,
            _marker: PhantomData,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Call and wait for the response until the connection ends
    pub async fn call(&self, conn: &ControlConnection, args: A) -> Result<R, RpcError> {
        self.call_with(conn, None, None, args).await
    }

    /// Call and give up after `timeout`
    pub async fn call_with_timeout(
        &self,
        conn: &ControlConnection,
        timeout: Duration,
        args: A,
    ) -> Result<R, RpcError> {
        self.call_with(conn, None, Some(timeout), args).await
    }

    /// Call with an optional cancellation signal and timeout
    ///
    /// Whichever comes first among the response, cancellation, the timeout
    /// and connection close decides the outcome, even while the request is
    /// still waiting to be written. The pending call is removed in every
    /// case, including when this future is dropped.
    pub async fn call_with(
        &self,
        conn: &ControlConnection,
        cancel: Option<&CancellationToken>,
        timeout: Option<Duration>,
        args: A,
    ) -> Result<R, RpcError> {
        if self.kind != CallKind::Request {
            return Err(RpcError::KindMismatch {
                method: self.method.to_string(),
                registered: self.kind,
            });
        }

        let values = args.encode_all()?;
        let id = conn.next_message_id();
        let rx = conn.pending().register(id)?;

        let pending = conn.pending().clone();
        let _guard = scopeguard::guard((), move |_| pending.cancel(id));

        // Cancellation, timeout and close also apply while the send is blocked
        let exchange = async {
            conn.send(ControlStreamMessage::request(
                id,
                &self.method,
                self.version,
                values,
            ))
            .await?;
            debug!(id, method = %self.method, version = self.version, "Sent request");
            rx.await.map_err(|_| RpcError::ConnectionFinished)
        };

        let response = tokio::select! {
            biased;
            response = exchange => response?,
            _ = conn.closed() => return Err(RpcError::ConnectionFinished),
            _ = cancelled(cancel) => return Err(RpcError::Cancelled),
            _ = expired(timeout) => return Err(RpcError::Timeout(timeout.unwrap_or_default())),
        };

        let body = response.body;
        if !body.status_code.is_ok() {
            return Err(ProtocolError::new(body.status_code, body.reason).into());
        }

        Ok(R::decode_all(&body.values)?)
    }

    /// Send a NOTIFY without waiting for anything back
    pub async fn notify(&self, conn: &ControlConnection, args: A) -> Result<(), RpcError> {
        if self.kind != CallKind::Notify {
            return Err(RpcError::KindMismatch {
                method: self.method.to_string(),
                registered: self.kind,
            });
        }

        let values = args.encode_all()?;
        let id = conn.next_message_id();
        conn.send(ControlStreamMessage::notify(
            id,
            &self.method,
            self.version,
            values,
        ))
        .await?;
        debug!(id, method = %self.method, version = self.version, "Sent notify");
        Ok(())
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn expired(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}
