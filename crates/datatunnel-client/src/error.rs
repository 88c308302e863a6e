//! Client errors

use crate::config::ConfigError;
use datatunnel_control::{RegisterError, RpcError};
use datatunnel_proto::HandshakeError;
use datatunnel_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Method registration failed: {0}")]
    Register(#[from] RegisterError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Failed to dial control stream: {0}")]
    Transport(#[from] TransportError),

    #[error("Authentication failed: {0}")]
    Authenticate(RpcError),

    /// The manager rejected the long-term credential; not retried
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Service registration failed: {0}")]
    RegisterServices(RpcError),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("No tunnel address for service {0}")]
    NoTunnelAddress(String),

    #[error("Failed to dial tunnel {address}: {source}")]
    TunnelDial {
        address: String,
        source: std::io::Error,
    },

    #[error("Tunnel handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Failed to dial local service {address}: {source}")]
    LocalDial {
        address: String,
        source: std::io::Error,
    },
}
