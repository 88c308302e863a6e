//! Control-stream RPC methods spoken between a gateway and its proxy manager
//!
//! Method names are part of the wire contract.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Client → manager REQUEST presenting the long-term credential
pub const METHOD_AUTHENTICATE: &str = "Authenticate";

/// Client → manager REQUEST advertising the locally exposed services
pub const METHOD_REGISTER_SERVICE: &str = "RegisterService";

/// Manager → client NOTIFY asking for a new tunneled connection
pub const METHOD_NEW_CONNECTION: &str = "NewConnection";

pub const RPC_VERSION_V1: u32 = 1;

/// Long-term identity credential of a gateway
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub secret: String,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// One entry of the `RegisterService` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_name: String,
    pub service_port: u16,
}

/// Payload of the `NewConnection` notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConnectionEvent {
    pub service_name: String,
    /// Single-use key presented on the tunnel handshake
    pub tunnel_key: Bytes,
    /// Tunnel rendezvous override; the client's configured default otherwise
    pub remote_addr: Option<String>,
}

crate::wire_message!(Credential, ServiceInfo, NewConnectionEvent);
