//! RPC correlation engine
//!
//! A [`ControlBase`] holds the registered server-side handlers and client-side
//! stubs for one side of a control stream. It is built once, then shared by
//! every connection it serves.
//!
//! # Dispatch
//!
//! Inbound REQUEST and NOTIFY messages go through:
//!
//! 1. resolve `(kind, method)` and the version (0 = highest registered)
//! 2. permission check, if one is installed
//! 3. decode each value against the handler's parameter type
//! 4. run the handler, turning a panic into a server error
//! 5. encode the return values into a RESPONSE (REQUEST only)
//!
//! Failures become an error RESPONSE for a REQUEST and a log line for a
//! NOTIFY. Inbound RESPONSE messages are matched to their pending call by id;
//! unmatched ones are dropped.

use crate::caller::RemoteCaller;
use crate::connection::{CallContext, ControlConnection};
use crate::error::{ProtocolError, RegisterError, RpcError};
use crate::registry::{CallKind, ClientMethods, ClientStub, MethodEntry, MethodRegistry};
use bytes::Bytes;
use datatunnel_proto::{ArgList, ControlStreamMessage, MessageKind};
use datatunnel_transport::MessageSource;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

type PermissionCheck = Arc<dyn Fn(&CallContext) -> bool + Send + Sync>;

/// Collects registrations before the engine is shared
#[derive(Default)]
pub struct ControlBaseBuilder {
    methods: MethodRegistry,
    client_methods: ClientMethods,
    permission_check: Option<PermissionCheck>,
}

impl ControlBaseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server-side handler for `(method, version, kind)`
    ///
    /// The handler receives the call context and the decoded argument tuple,
    /// and returns the tuple of values to send back. Returning a
    /// [`ProtocolError`] fails the call with that status.
    pub fn register_rpc<A, R, F, Fut>(
        &mut self,
        method: &str,
        version: u32,
        kind: CallKind,
        handler: F,
    ) -> Result<&mut Self, RegisterError>
    where
        A: ArgList,
        R: ArgList,
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ProtocolError>> + Send + 'static,
    {
        self.methods
            .insert(kind, method, MethodEntry::new(version, handler))?;
        debug!(method, version, kind = %kind, "Registered RPC handler");
        Ok(self)
    }

    /// Record the shape of a remote method this side will call
    pub fn register_client_method<A, R>(
        &mut self,
        method: &str,
        version: u32,
        kind: CallKind,
    ) -> Result<&mut Self, RegisterError>
    where
        A: ArgList,
        R: ArgList,
    {
        self.client_methods.insert(
            method,
            version,
            ClientStub {
                kind,
                args: A::shape(),
                returns: R::shape(),
            },
        )?;
        Ok(self)
    }

    /// Install a callback that may veto inbound calls with `FORBIDDEN`
    pub fn with_permission_check<F>(&mut self, check: F) -> &mut Self
    where
        F: Fn(&CallContext) -> bool + Send + Sync + 'static,
    {
        self.permission_check = Some(Arc::new(check));
        self
    }

    pub fn build(self) -> ControlBase {
        ControlBase {
            inner: Arc::new(BaseInner {
                methods: self.methods,
                client_methods: self.client_methods,
                permission_check: self.permission_check,
            }),
        }
    }
}

/// The RPC engine shared by all connections of one endpoint
#[derive(Clone)]
pub struct ControlBase {
    inner: Arc<BaseInner>,
}

struct BaseInner {
    methods: MethodRegistry,
    client_methods: ClientMethods,
    permission_check: Option<PermissionCheck>,
}

impl fmt::Debug for ControlBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBase")
            .field("methods", &self.inner.methods.len())
            .field("permission_check", &self.inner.permission_check.is_some())
            .finish()
    }
}

impl ControlBase {
    pub fn builder() -> ControlBaseBuilder {
        ControlBaseBuilder::new()
    }

    /// Create a typed caller for a registered client method
    ///
    /// `A` and `R` must match the shape the method was registered with.
    pub fn new_remote_caller<A, R>(
        &self,
        method: &str,
        version: u32,
    ) -> Result<RemoteCaller<A, R>, RpcError>
    where
        A: ArgList,
        R: ArgList,
    {
        let stub = self
            .inner
            .client_methods
            .get(method, version)
            .ok_or_else(|| RpcError::ClientMethodNotFound {
                method: method.to_string(),
                version,
            })?;

        if stub.args != A::shape() || stub.returns != R::shape() {
            return Err(RpcError::ClientShapeMismatch {
                method: method.to_string(),
                version,
            });
        }

        Ok(RemoteCaller::new(method, version, stub.kind))
    }

    /// Handle one inbound message
    pub async fn handle_message(&self, conn: &ControlConnection, msg: ControlStreamMessage) {
        let id = msg.id();

        match msg.kind() {
            Ok(MessageKind::Response) => {
                if !conn.pending().respond(id, msg) {
                    warn!(
                        connection_id = %conn.id(),
                        id,
                        "Dropping response with no pending call"
                    );
                }
            }
            Ok(MessageKind::Request) => {
                let method = msg.body.method.clone();
                let reply = match self.dispatch(conn, CallKind::Request, msg).await {
                    Ok(values) => ControlStreamMessage::response(id, values),
                    Err(e) => {
                        debug!(id, method = %method, error = %e, "Request failed");
                        ControlStreamMessage::error_response(id, e.code, e.reason)
                    }
                };

                if let Err(e) = conn.send(reply).await {
                    warn!(id, method = %method, error = %e, "Failed to send response");
                }
            }
            Ok(MessageKind::Notify) => {
                let method = msg.body.method.clone();
                if let Err(e) = self.dispatch(conn, CallKind::Notify, msg).await {
                    warn!(id, method = %method, error = %e, "Notify handler failed");
                }
            }
            Err(raw) => {
                warn!(id, kind = raw, "Received unknown message type");
                let err = ProtocolError::unknown_message_type(raw);
                if let Err(e) = conn
                    .send(ControlStreamMessage::error_response(id, err.code, err.reason))
                    .await
                {
                    warn!(id, error = %e, "Failed to send response");
                }
            }
        }
    }

    async fn dispatch(
        &self,
        conn: &ControlConnection,
        kind: CallKind,
        msg: ControlStreamMessage,
    ) -> Result<Vec<Bytes>, ProtocolError> {
        let ControlStreamMessage { header, body } = msg;
        let entry = self.inner.methods.resolve(kind, &body.method, body.version)?;

        let ctx = CallContext {
            connection: conn.clone(),
            method: body.method,
            version: entry.version,
            kind,
            message_id: header.id,
        };

        if let Some(check) = &self.inner.permission_check {
            if !check(&ctx) {
                return Err(ProtocolError::forbidden(&ctx.method));
            }
        }

        let method = ctx.method.clone();
        let future = (entry.handler)(ctx, body.values);

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                error!(method = %method, panic = %detail, "RPC handler panicked");
                Err(ProtocolError::server_error(format!(
                    "handler for {} panicked: {}",
                    method, detail
                )))
            }
        }
    }

    /// Run the read loop for one connection
    ///
    /// RESPONSEs are delivered inline; each REQUEST and NOTIFY is handled in
    /// its own task so slow handlers never block correlation. Returns when
    /// the peer closes the stream, the connection is closed locally, or the
    /// source fails. On return every pending call has failed with
    /// [`RpcError::ConnectionFinished`].
    ///
    /// Handler tasks still running when the loop ends are aborted. Work that
    /// must outlive the connection has to be spawned by the handler itself.
    pub async fn serve(
        &self,
        conn: ControlConnection,
        mut source: Box<dyn MessageSource>,
    ) -> Result<(), RpcError> {
        info!(connection_id = %conn.id(), peer = %conn.peer(), "Serving control stream");
        let mut handlers = JoinSet::new();

        let result = loop {
            tokio::select! {
                biased;
                _ = conn.closed() => {
                    debug!(connection_id = %conn.id(), "Control stream closed locally");
                    break Ok(());
                }
                received = source.recv() => match received {
                    Ok(Some(msg)) => {
                        if msg.kind() == Ok(MessageKind::Response) {
                            self.handle_message(&conn, msg).await;
                        } else {
                            let base = self.clone();
                            let conn = conn.clone();
                            handlers.spawn(async move { base.handle_message(&conn, msg).await });
                        }
                    }
                    Ok(None) => {
                        info!(connection_id = %conn.id(), "Control stream closed by peer");
                        break Ok(());
                    }
                    Err(e) => {
                        error!(connection_id = %conn.id(), error = %e, "Control stream failed");
                        break Err(RpcError::from(e));
                    }
                },
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        warn!(connection_id = %conn.id(), error = %e, "Handler task failed");
                    }
                }
            }
        };

        conn.shutdown().await;
        handlers.shutdown().await;
        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
