//! Error taxonomy of the RPC engine

use crate::registry::CallKind;
use datatunnel_proto::{CodecError, StatusCode};
use datatunnel_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// A typed protocol failure carried on the wire as `status_code` + `reason`
///
/// Handlers return this to fail a call; callers receive it unchanged when the
/// peer answers with a non-zero status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} (status {code})", code = .code.0)]
pub struct ProtocolError {
    pub code: StatusCode,
    pub reason: String,
}

impl ProtocolError {
    pub fn new(code: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn server_error(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVER_ERROR, reason)
    }

    pub fn unknown_message_type(kind: u8) -> Self {
        Self::new(
            StatusCode::UNKNOWN_MESSAGE_TYPE,
            format!("unknown message type {}", kind),
        )
    }

    pub fn forbidden(method: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, format!("calling {} is forbidden", method))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            StatusCode::METHOD_NOT_FOUND,
            format!("method {} not found", method),
        )
    }

    pub fn version_not_supported(method: &str, version: u32) -> Self {
        Self::new(
            StatusCode::VERSION_NOT_SUPPORTED,
            format!("method {} does not support version {}", method, version),
        )
    }

    /// Application-level failure; `code` should be at or above
    /// [`StatusCode::APPLICATION_BASE`]
    pub fn application(code: StatusCode, reason: impl Into<String>) -> Self {
        Self::new(code, reason)
    }

    pub fn is(&self, code: StatusCode) -> bool {
        self.code == code
    }
}

impl From<CodecError> for ProtocolError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::InvalidArgNum { .. } => {
                ProtocolError::new(StatusCode::INVALID_ARG_NUM, err.to_string())
            }
            other => ProtocolError::new(StatusCode::INVALID_ARG_TYPE, other.to_string()),
        }
    }
}

/// Startup-time registration failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("invalid register version 0 for method {method}")]
    InvalidRegisterVersion { method: String },

    #[error("method {method} version {version} ({kind}) is already registered")]
    DoubleRegister {
        method: String,
        version: u32,
        kind: CallKind,
    },
}

/// Errors surfaced to the caller of a remote method
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Remote error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Call cancelled")]
    Cancelled,

    #[error("Connection finished")]
    ConnectionFinished,

    #[error("Client method not found: {method} version {version}")]
    ClientMethodNotFound { method: String, version: u32 },

    #[error("Client method {method} version {version} was registered with a different shape")]
    ClientShapeMismatch { method: String, version: u32 },

    #[error("Client method {method} is registered as {registered}")]
    KindMismatch { method: String, registered: CallKind },

    #[error("Call id {0} is already pending")]
    DuplicateCallId(u64),
}

impl RpcError {
    /// Wire status code if the peer answered with a protocol error
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            RpcError::Protocol(e) => Some(e.code),
            _ => None,
        }
    }
}
