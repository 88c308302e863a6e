//! Client configuration

use crate::reconnect::ReconnectConfig;
use crate::services::{ProxyService, ServiceRegistry};
use datatunnel_proto::Credential;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("control_address is required")]
    MissingControlAddress,

    #[error("credential id is required")]
    MissingCredentialId,

    #[error("service name must not be empty")]
    EmptyServiceName,

    #[error("service {service} has an invalid address {address:?}, expected host:port")]
    InvalidServiceAddress { service: String, address: String },

    #[error("service {0} is configured more than once")]
    DuplicateService(String),
}

/// Proxy control client configuration
#[derive(Debug, Clone)]
pub struct ProxyClientConfig {
    /// Proxy manager control endpoint
    pub control_address: String,
    /// Default tunnel rendezvous, used when a NewConnection event names none
    pub tunnel_address: Option<String>,
    pub credential: Credential,
    pub services: Vec<ProxyService>,
    pub reconnect: ReconnectConfig,
    /// Timeout for the Authenticate and RegisterService calls
    pub call_timeout: Duration,
    /// Timeout for dialing the tunnel rendezvous and local services
    pub dial_timeout: Duration,
}

impl Default for ProxyClientConfig {
    fn default() -> Self {
        Self {
            control_address: String::new(),
            tunnel_address: None,
            credential: Credential::new("", ""),
            services: Vec::new(),
            reconnect: ReconnectConfig::default(),
            call_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

impl ProxyClientConfig {
    pub fn builder() -> ProxyClientConfigBuilder {
        ProxyClientConfigBuilder::default()
    }
}

/// Builder for ProxyClientConfig
#[derive(Default)]
pub struct ProxyClientConfigBuilder {
    config: ProxyClientConfig,
    service_addresses: Vec<(String, String)>,
}

impl ProxyClientConfigBuilder {
    pub fn control_address(mut self, address: impl Into<String>) -> Self {
        self.config.control_address = address.into();
        self
    }

    pub fn tunnel_address(mut self, address: impl Into<String>) -> Self {
        self.config.tunnel_address = Some(address.into());
        self
    }

    pub fn credential(mut self, id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.config.credential = Credential::new(id, secret);
        self
    }

    pub fn service(mut self, service: ProxyService) -> Self {
        self.config.services.push(service);
        self
    }

    /// Add a service given as `host:port`; the address is validated by `build`
    pub fn service_address(mut self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.service_addresses.push((name.into(), address.into()));
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    pub fn build(mut self) -> Result<ProxyClientConfig, ConfigError> {
        if self.config.control_address.is_empty() {
            return Err(ConfigError::MissingControlAddress);
        }
        if self.config.credential.id.is_empty() {
            return Err(ConfigError::MissingCredentialId);
        }

        for (name, address) in self.service_addresses {
            self.config.services.push(ProxyService::parse(name, &address)?);
        }

        // Rejects empty and duplicate names
        ServiceRegistry::new(self.config.services.clone())?;

        Ok(self.config)
    }
}
