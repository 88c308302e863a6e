//! Gateway side of the datatunnel
//!
//! [`ProxyControlClient`] authenticates to a proxy manager, advertises the
//! local services it can expose and opens a tunneled TCP connection for each
//! `NewConnection` notification it receives.

pub mod client;
pub mod config;
pub mod error;
pub mod reconnect;
pub mod services;
pub mod splice;
pub mod tunnel;

pub use client::{ClientState, ProxyControlClient};
pub use config::{ConfigError, ProxyClientConfig, ProxyClientConfigBuilder};
pub use error::ClientError;
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use services::{ProxyService, ServiceRegistry};
pub use splice::{splice, SpliceDirection, SpliceError, SpliceStats};
pub use tunnel::{dial_local, dial_tunnel};
