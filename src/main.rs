//! Datatunnel gateway - proxy control client CLI
//!
//! Keeps a control stream to a proxy manager open, advertises local services
//! and splices every tunneled connection the manager requests onto the
//! matching local service.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use datatunnel_client::{ProxyClientConfig, ProxyControlClient, ProxyService, ReconnectConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Datatunnel gateway - exposes local services through a proxy manager
#[derive(Parser, Debug)]
#[command(name = "datatunnel")]
#[command(about = "Datatunnel gateway - exposes local services through a proxy manager")]
#[command(version)]
#[command(long_about = r#"
Datatunnel connects to a proxy manager, authenticates with a long-term
credential and registers the local services it can reach. Each time the
manager receives a connection for one of those services, the gateway opens
a tunnel back to the manager and relays bytes to the local service.

EXAMPLES:
  # Expose a local web server
  datatunnel --control-address manager.example.com:7000 \
    --tunnel-address manager.example.com:7001 \
    --credential-id gateway-1 \
    --service http=127.0.0.1:8080

  # Start from a config file
  datatunnel --config gateway.yaml --log-level debug

ENVIRONMENT VARIABLES:
  DATATUNNEL_CONTROL_ADDRESS  Proxy manager control address
  DATATUNNEL_TUNNEL_ADDRESS   Default tunnel rendezvous address
  DATATUNNEL_CREDENTIAL_ID    Gateway identifier
  DATATUNNEL_SECRET           Gateway secret
"#)]
struct Args {
    /// Proxy manager control address (e.g., manager.example.com:7000)
    #[arg(long, env = "DATATUNNEL_CONTROL_ADDRESS")]
    control_address: Option<String>,

    /// Default tunnel rendezvous address (e.g., manager.example.com:7001)
    #[arg(long, env = "DATATUNNEL_TUNNEL_ADDRESS")]
    tunnel_address: Option<String>,

    /// Gateway identifier
    #[arg(long, env = "DATATUNNEL_CREDENTIAL_ID")]
    credential_id: Option<String>,

    /// Gateway secret
    #[arg(long, env = "DATATUNNEL_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Service to expose as name=host:port (repeatable)
    #[arg(long = "service", value_name = "NAME=HOST:PORT")]
    services: Vec<String>,

    /// Reconnect policy
    #[arg(long, value_enum)]
    reconnect: Option<ReconnectPolicy>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReconnectPolicy {
    /// Retry every 10 seconds
    Fixed,
    /// Retry after 2s, doubling up to 600s
    Exponential,
}

impl From<ReconnectPolicy> for ReconnectConfig {
    fn from(policy: ReconnectPolicy) -> Self {
        match policy {
            ReconnectPolicy::Fixed => ReconnectConfig::default(),
            ReconnectPolicy::Exponential => ReconnectConfig::exponential(),
        }
    }
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    manager: ManagerConfig,

    #[serde(default)]
    credential: CredentialConfig,

    /// Service name to `host:port`
    #[serde(default)]
    services: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    reconnect: Option<ReconnectPolicy>,

    /// Timeout for Authenticate and RegisterService, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    call_timeout_secs: Option<u64>,

    /// Timeout for tunnel and local service dials, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dial_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManagerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    control_address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    tunnel_address: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,

    /// Environment variable holding the secret
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_env: Option<String>,

    /// Direct secret (prefer using secret_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    secret: Option<String>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Split a `name=host:port` service argument
fn parse_service_arg(arg: &str) -> Result<(String, String)> {
    let (name, address) = arg
        .split_once('=')
        .with_context(|| format!("Invalid service '{}' (expected name=host:port)", arg))?;
    Ok((name.trim().to_string(), address.trim().to_string()))
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_client_config(args: Args) -> Result<ProxyClientConfig> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let control_address = args
        .control_address
        .or(file.manager.control_address)
        .context("Control address is required (use --control-address or config file)")?;

    let credential_id = args
        .credential_id
        .or(file.credential.id)
        .context("Credential id is required (use --credential-id or config file)")?;

    let secret = match (args.secret, &file.credential.secret_env) {
        (Some(secret), _) => secret,
        (None, Some(env_var)) => std::env::var(env_var)
            .with_context(|| format!("Environment variable {} not set", env_var))?,
        (None, None) => file.credential.secret.unwrap_or_default(),
    };

    // CLI services replace the file's entry with the same name
    let mut services = file.services;
    for arg in &args.services {
        let (name, address) = parse_service_arg(arg)?;
        services.insert(name, address);
    }

    let reconnect = args
        .reconnect
        .or(file.reconnect)
        .unwrap_or(ReconnectPolicy::Fixed);

    let mut builder = ProxyClientConfig::builder()
        .control_address(control_address)
        .credential(credential_id, secret)
        .reconnect(reconnect.into());

    if let Some(tunnel_address) = args.tunnel_address.or(file.manager.tunnel_address) {
        builder = builder.tunnel_address(tunnel_address);
    }
    if let Some(secs) = file.call_timeout_secs {
        builder = builder.call_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = file.dial_timeout_secs {
        builder = builder.dial_timeout(Duration::from_secs(secs));
    }
    for (name, address) in services {
        builder = builder.service_address(name, address);
    }

    builder.build().context("Invalid gateway configuration")
}

fn describe_service(service: &ProxyService) -> String {
    format!("{} -> {}", service.service_name, service.address())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("Datatunnel gateway starting...");

    let config = build_client_config(args).context("Failed to build gateway configuration")?;

    // Log configuration (but not the secret)
    info!("Credential ID: {}", config.credential.id);
    info!("Control address: {}", config.control_address);
    if let Some(tunnel_address) = &config.tunnel_address {
        info!("Tunnel address: {}", tunnel_address);
    }
    for service in &config.services {
        info!("Service: {}", describe_service(service));
    }

    let client = ProxyControlClient::tcp(config).context("Failed to create gateway client")?;
    let shutdown = CancellationToken::new();

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut client_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { client.run(shutdown).await }
    });

    let result = tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
            (&mut client_task).await
        }
        result = &mut client_task => result,
    };

    match result {
        Ok(Ok(())) => info!("Gateway stopped"),
        Ok(Err(e)) => {
            error!("Gateway error: {}", e);
            return Err(e.into());
        }
        Err(e) => {
            error!("Gateway task panicked: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
