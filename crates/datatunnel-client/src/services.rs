//! Locally exposed services

use crate::config::ConfigError;
use datatunnel_proto::ServiceInfo;
use std::collections::HashMap;

/// A local TCP service the proxy manager may open tunnels to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyService {
    pub service_name: String,
    pub service_host: String,
    pub service_port: u16,
}

impl ProxyService {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: name.into(),
            service_host: host.into(),
            service_port: port,
        }
    }

    /// Parse `host:port`
    pub fn parse(name: impl Into<String>, address: &str) -> Result<Self, ConfigError> {
        let name = name.into();
        let invalid = || ConfigError::InvalidServiceAddress {
            service: name.clone(),
            address: address.to_string(),
        };

        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self::new(name, host, port))
    }

    /// Address to dial, `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.service_host, self.service_port)
    }
}

/// Services by name, fixed for the lifetime of a client
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ProxyService>,
}

impl ServiceRegistry {
    pub fn new(services: Vec<ProxyService>) -> Result<Self, ConfigError> {
        let mut registry = HashMap::with_capacity(services.len());
        for service in services {
            if service.service_name.is_empty() {
                return Err(ConfigError::EmptyServiceName);
            }
            if registry.contains_key(&service.service_name) {
                return Err(ConfigError::DuplicateService(service.service_name));
            }
            registry.insert(service.service_name.clone(), service);
        }
        Ok(Self { services: registry })
    }

    pub fn get(&self, name: &str) -> Option<&ProxyService> {
        self.services.get(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// `RegisterService` payload, ordered by service name
    pub fn service_infos(&self) -> Vec<ServiceInfo> {
        let mut infos: Vec<ServiceInfo> = self
            .services
            .values()
            .map(|s| ServiceInfo {
                service_name: s.service_name.clone(),
                service_port: s.service_port,
            })
            .collect();
        infos.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let service = ProxyService::parse("http", "127.0.0.1:8080").unwrap();
        assert_eq!(service, ProxyService::new("http", "127.0.0.1", 8080));
        assert_eq!(service.address(), "127.0.0.1:8080");

        let v6 = ProxyService::parse("ssh", "[::1]:22").unwrap();
        assert_eq!(v6.address(), "[::1]:22");
    }

    #[test]
    fn test_parse_invalid_address() {
        for address in ["localhost", ":80", "host:http", "host:70000"] {
            assert!(
                matches!(
                    ProxyService::parse("svc", address),
                    Err(ConfigError::InvalidServiceAddress { .. })
                ),
                "{address} should be rejected"
            );
        }
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let result = ServiceRegistry::new(vec![
            ProxyService::new("http", "127.0.0.1", 80),
            ProxyService::new("http", "127.0.0.1", 8080),
        ]);
        assert!(matches!(result, Err(ConfigError::DuplicateService(name)) if name == "http"));
    }

    #[test]
    fn test_service_infos_sorted() {
        let registry = ServiceRegistry::new(vec![
            ProxyService::new("ssh", "10.0.0.2", 22),
            ProxyService::new("http", "127.0.0.1", 8080),
        ])
        .unwrap();

        let infos = registry.service_infos();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].service_name, "http");
        assert_eq!(infos[0].service_port, 8080);
        assert_eq!(infos[1].service_name, "ssh");
        assert!(registry.get("ssh").is_some());
        assert!(registry.get("ftp").is_none());
    }
}
