//! Proxy control client
//!
//! Keeps one control stream to the proxy manager alive:
//!
//! ```text
//! Disconnected → Dialing → Authenticating → Running → Disconnected ...
//!                               │
//!                               └─ invalid credential → Stopped
//! ```
//!
//! While running, every `NewConnection` notification opens a tunneled
//! connection to the manager and a connection to the named local service,
//! then splices the two.

use crate::config::ProxyClientConfig;
use crate::error::ClientError;
use crate::reconnect::ReconnectManager;
use crate::services::{ProxyService, ServiceRegistry};
use crate::splice::splice;
use crate::tunnel::{dial_local, dial_tunnel};
use bytes::Bytes;
use datatunnel_control::{
    CallKind, ControlBase, ControlConnection, ProtocolError, RemoteCaller, RpcError,
};
use datatunnel_proto::rpc::{
    METHOD_AUTHENTICATE, METHOD_NEW_CONNECTION, METHOD_REGISTER_SERVICE, RPC_VERSION_V1,
};
use datatunnel_proto::{Credential, NewConnectionEvent, ServiceInfo, StatusCode};
use datatunnel_transport::{ControlConnector, TcpConnector};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection state of a [`ProxyControlClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Dialing,
    Authenticating,
    Running,
    /// Terminal; the credential was rejected
    Stopped,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Dialing => "dialing",
            ClientState::Authenticating => "authenticating",
            ClientState::Running => "running",
            ClientState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// State shared with the `NewConnection` handler and tunnel tasks
struct Shared {
    services: ServiceRegistry,
    tunnel_address: Option<String>,
    dial_timeout: Duration,
    active_tunnels: AtomicUsize,
}

impl Shared {
    /// Pick the local service and tunnel rendezvous for an event
    fn resolve_target(
        &self,
        event: &NewConnectionEvent,
    ) -> Result<(ProxyService, String), ClientError> {
        let service = self
            .services
            .get(&event.service_name)
            .cloned()
            .ok_or_else(|| ClientError::ServiceNotFound(event.service_name.clone()))?;

        let address = event
            .remote_addr
            .as_deref()
            .filter(|addr| !addr.is_empty())
            .or(self.tunnel_address.as_deref())
            .ok_or_else(|| ClientError::NoTunnelAddress(event.service_name.clone()))?;

        Ok((service, address.to_string()))
    }

    fn on_new_connection(self: &Arc<Self>, event: NewConnectionEvent) -> Result<(), ClientError> {
        let (service, address) = self.resolve_target(&event)?;
        debug!(
            service = %service.service_name,
            tunnel_address = %address,
            "Opening tunneled connection"
        );

        let shared = self.clone();
        tokio::spawn(async move { shared.open_tunnel(service, address, event.tunnel_key).await });
        Ok(())
    }

    async fn open_tunnel(self: Arc<Self>, service: ProxyService, address: String, key: Bytes) {
        let (tunnel, local) = tokio::join!(
            dial_tunnel(&address, &key, self.dial_timeout),
            dial_local(&service, self.dial_timeout),
        );

        let (tunnel, local) = match (tunnel, local) {
            (Ok(tunnel), Ok(local)) => (tunnel, local),
            (tunnel, local) => {
                // The connection that did succeed is dropped, which closes it
                for err in [tunnel.err(), local.err()].into_iter().flatten() {
                    warn!(
                        service = %service.service_name,
                        error = %err,
                        "Abandoning tunneled connection"
                    );
                }
                return;
            }
        };

        self.active_tunnels.fetch_add(1, Ordering::SeqCst);
        let _active = scopeguard::guard(&self.active_tunnels, |count| {
            count.fetch_sub(1, Ordering::SeqCst);
        });

        match splice(tunnel, local).await {
            Ok(stats) => debug!(
                service = %service.service_name,
                first_finished = %stats.first_finished,
                bytes_to_local = stats.bytes_to_local,
                bytes_to_tunnel = stats.bytes_to_tunnel,
                "Tunneled connection closed"
            ),
            Err(e) => debug!(
                service = %service.service_name,
                error = %e,
                "Tunneled connection closed with error"
            ),
        }
    }
}

/// Gateway side of the control stream
pub struct ProxyControlClient<C = TcpConnector> {
    config: ProxyClientConfig,
    connector: C,
    base: ControlBase,
    authenticate: RemoteCaller<(Credential,), ()>,
    register_service: RemoteCaller<(Vec<ServiceInfo>,), ()>,
    shared: Arc<Shared>,
    state: watch::Sender<ClientState>,
}

impl ProxyControlClient<TcpConnector> {
    /// Client dialing the control stream over plain TCP
    pub fn tcp(config: ProxyClientConfig) -> Result<Self, ClientError> {
        let connector = TcpConnector::new(config.dial_timeout);
        Self::new(config, connector)
    }
}

impl<C: ControlConnector> ProxyControlClient<C> {
    pub fn new(config: ProxyClientConfig, connector: C) -> Result<Self, ClientError> {
        let shared = Arc::new(Shared {
            services: ServiceRegistry::new(config.services.clone())?,
            tunnel_address: config.tunnel_address.clone(),
            dial_timeout: config.dial_timeout,
            active_tunnels: AtomicUsize::new(0),
        });

        let mut builder = ControlBase::builder();
        let handler_shared = shared.clone();
        builder
            .register_rpc(
                METHOD_NEW_CONNECTION,
                RPC_VERSION_V1,
                CallKind::Notify,
                move |_ctx, (event,): (NewConnectionEvent,)| {
                    let result = handler_shared
                        .on_new_connection(event)
                        .map_err(|e| ProtocolError::server_error(e.to_string()));
                    async move { result }
                },
            )?
            .register_client_method::<(Credential,), ()>(
                METHOD_AUTHENTICATE,
                RPC_VERSION_V1,
                CallKind::Request,
            )?
            .register_client_method::<(Vec<ServiceInfo>,), ()>(
                METHOD_REGISTER_SERVICE,
                RPC_VERSION_V1,
                CallKind::Request,
            )?;
        let base = builder.build();

        let authenticate = base.new_remote_caller(METHOD_AUTHENTICATE, RPC_VERSION_V1)?;
        let register_service = base.new_remote_caller(METHOD_REGISTER_SERVICE, RPC_VERSION_V1)?;
        let (state, _) = watch::channel(ClientState::Disconnected);

        Ok(Self {
            config,
            connector,
            base,
            authenticate,
            register_service,
            shared,
            state,
        })
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Receive every state transition
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    /// Number of tunneled connections currently being spliced
    pub fn active_tunnels(&self) -> usize {
        self.shared.active_tunnels.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: ClientState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Client state changed");
        }
    }

    /// Keep the control stream connected until `shutdown` fires
    ///
    /// Returns `Ok(())` on shutdown. The only error is a rejected credential,
    /// which is never retried.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ClientError> {
        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());

        loop {
            match self.run_session(&shutdown, &mut reconnect).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Disconnected) => info!("Control stream ended"),
                Err(ClientError::InvalidCredential(reason)) => {
                    self.set_state(ClientState::Stopped);
                    error!(reason = %reason, "Credential rejected, not reconnecting");
                    return Err(ClientError::InvalidCredential(reason));
                }
                Err(e) => warn!(error = %e, "Control session failed"),
            }

            self.set_state(ClientState::Disconnected);
            if reconnect.wait_or_cancel(&shutdown).await.is_err() {
                break;
            }
        }

        self.set_state(ClientState::Disconnected);
        info!("Proxy control client shut down");
        Ok(())
    }

    async fn run_session(
        &self,
        shutdown: &CancellationToken,
        reconnect: &mut ReconnectManager,
    ) -> Result<SessionEnd, ClientError> {
        self.set_state(ClientState::Dialing);
        let channel = tokio::select! {
            channel = self.connector.connect(&self.config.control_address) => channel?,
            _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
        };

        let (conn, source) = ControlConnection::from_channel(channel);
        info!(connection_id = %conn.id(), peer = %conn.peer(), "Control stream connected");

        let mut serve = tokio::spawn({
            let base = self.base.clone();
            let conn = conn.clone();
            async move { base.serve(conn, source).await }
        });
        let _close = scopeguard::guard(conn.clone(), |conn| conn.close());

        let timeout = Some(self.config.call_timeout);

        self.set_state(ClientState::Authenticating);
        let credential = self.config.credential.clone();
        if let Err(e) = self
            .authenticate
            .call_with(&conn, Some(shutdown), timeout, (credential,))
            .await
        {
            return match e {
                RpcError::Cancelled => Ok(SessionEnd::Shutdown),
                RpcError::Protocol(p) if p.is(StatusCode::INVALID_CREDENTIAL) => {
                    Err(ClientError::InvalidCredential(p.reason))
                }
                other => Err(ClientError::Authenticate(other)),
            };
        }

        let services = self.shared.services.service_infos();
        if let Err(e) = self
            .register_service
            .call_with(&conn, Some(shutdown), timeout, (services,))
            .await
        {
            return match e {
                RpcError::Cancelled => Ok(SessionEnd::Shutdown),
                other => Err(ClientError::RegisterServices(other)),
            };
        }
        info!(services = self.shared.services.len(), "Services registered");

        self.set_state(ClientState::Running);
        reconnect.reset();

        tokio::select! {
            joined = &mut serve => {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Control stream failed"),
                    Err(e) => warn!(error = %e, "Control stream task failed"),
                }
                Ok(SessionEnd::Disconnected)
            }
            _ = shutdown.cancelled() => {
                conn.close();
                let _ = (&mut serve).await;
                Ok(SessionEnd::Shutdown)
            }
        }
    }
}
