//! Method registries
//!
//! Server-side handlers are keyed by `(kind, method)` and then by version.
//! Client-side stubs are keyed by `(method, version)` and remember the shape
//! used to build outgoing calls. Both are filled at startup and read-only
//! once the owning [`ControlBase`](crate::ControlBase) is built.

use crate::connection::CallContext;
use crate::error::{ProtocolError, RegisterError};
use bytes::Bytes;
use datatunnel_proto::{ArgList, MessageKind, ValueShape};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Whether a method answers (REQUEST) or is fire-and-forget (NOTIFY)
///
/// Request-typed and notify-typed registrations live in separate namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Request,
    Notify,
}

impl From<CallKind> for MessageKind {
    fn from(kind: CallKind) -> Self {
        match kind {
            CallKind::Request => MessageKind::Request,
            CallKind::Notify => MessageKind::Notify,
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&MessageKind::from(*self), f)
    }
}

pub(crate) type BoxedHandler = Arc<
    dyn Fn(CallContext, Vec<Bytes>) -> BoxFuture<'static, Result<Vec<Bytes>, ProtocolError>>
        + Send
        + Sync,
>;

/// A registered server-side method
#[derive(Clone)]
pub(crate) struct MethodEntry {
    pub(crate) handler: BoxedHandler,
    pub(crate) version: u32,
    pub(crate) args: Vec<ValueShape>,
    pub(crate) returns: Vec<ValueShape>,
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodEntry")
            .field("version", &self.version)
            .field("args", &self.args)
            .field("returns", &self.returns)
            .finish_non_exhaustive()
    }
}

impl MethodEntry {
    /// Erase a typed handler into one that decodes its arguments and encodes
    /// its return values
    pub(crate) fn new<A, R, F, Fut>(version: u32, handler: F) -> Self
    where
        A: ArgList,
        R: ArgList,
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ProtocolError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: BoxedHandler = Arc::new(move |ctx: CallContext, values: Vec<Bytes>| {
            let handler = handler.clone();
            async move {
                let args = A::decode_all(&values)?;
                let returns = handler(ctx, args).await?;
                returns.encode_all().map_err(|e| {
                    ProtocolError::server_error(format!("failed to encode return values: {}", e))
                })
            }
            .boxed()
        });

        Self {
            handler: erased,
            version,
            args: A::shape(),
            returns: R::shape(),
        }
    }
}

/// Server-side method table
#[derive(Debug, Default)]
pub(crate) struct MethodRegistry {
    methods: HashMap<(CallKind, String), BTreeMap<u32, MethodEntry>>,
}

impl MethodRegistry {
    pub(crate) fn insert(
        &mut self,
        kind: CallKind,
        method: &str,
        entry: MethodEntry,
    ) -> Result<(), RegisterError> {
        let version = entry.version;
        if version == 0 {
            return Err(RegisterError::InvalidRegisterVersion {
                method: method.to_string(),
            });
        }

        let versions = self
            .methods
            .entry((kind, method.to_string()))
            .or_default();
        if versions.contains_key(&version) {
            return Err(RegisterError::DoubleRegister {
                method: method.to_string(),
                version,
                kind,
            });
        }

        versions.insert(version, entry);
        Ok(())
    }

    /// Find the handler for an inbound call
    ///
    /// Version 0 selects the highest registered version.
    pub(crate) fn resolve(
        &self,
        kind: CallKind,
        method: &str,
        version: u32,
    ) -> Result<&MethodEntry, ProtocolError> {
        let versions = self
            .methods
            .get(&(kind, method.to_string()))
            .ok_or_else(|| ProtocolError::method_not_found(method))?;

        let entry = if version == 0 {
            versions.values().next_back()
        } else {
            versions.get(&version)
        };

        entry.ok_or_else(|| ProtocolError::version_not_supported(method, version))
    }

    pub(crate) fn len(&self) -> usize {
        self.methods.values().map(BTreeMap::len).sum()
    }
}

/// Shape of a remote method this side may call
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClientStub {
    pub(crate) kind: CallKind,
    pub(crate) args: Vec<ValueShape>,
    pub(crate) returns: Vec<ValueShape>,
}

/// Client-side stub table
#[derive(Debug, Default)]
pub(crate) struct ClientMethods {
    stubs: HashMap<(String, u32), ClientStub>,
}

impl ClientMethods {
    pub(crate) fn insert(
        &mut self,
        method: &str,
        version: u32,
        stub: ClientStub,
    ) -> Result<(), RegisterError> {
        if version == 0 {
            return Err(RegisterError::InvalidRegisterVersion {
                method: method.to_string(),
            });
        }

        let key = (method.to_string(), version);
        if self.stubs.contains_key(&key) {
            return Err(RegisterError::DoubleRegister {
                method: method.to_string(),
                version,
                kind: stub.kind,
            });
        }

        self.stubs.insert(key, stub);
        Ok(())
    }

    pub(crate) fn get(&self, method: &str, version: u32) -> Option<&ClientStub> {
        self.stubs.get(&(method.to_string(), version))
    }
}
