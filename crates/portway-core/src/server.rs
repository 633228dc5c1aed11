//! Proxy server session lifecycle
//!
//! The server owns the tunnel registry and drives each tunnel through its
//! life: `on_accept` registers and begins a tunnel, the tunnel's single close
//! notification prunes it, and `stop` asks every registered tunnel to close.
//!
//! Per-tunnel slot state: `absent -> registered -> absent`. A forced close
//! never changes slot state by itself; only the tunnel's close notification
//! does.

use crate::error::StartError;
use crate::observer::ServerObserver;
use crate::registry::{TunnelRegistry, TunnelSummary};
use crate::tunnel::{ProxySocket, Tunnel, TunnelCloseListener, TunnelFactory, TunnelId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Identity of a server, passed to observers with every event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Bind address; `None` means all interfaces
    pub address: Option<Ipv4Addr>,
    pub port: u16,
    /// Descriptive type tag (e.g. "http-connect")
    pub kind: String,
}

impl ServerInfo {
    pub fn new(address: Option<Ipv4Addr>, port: u16, kind: impl Into<String>) -> Self {
        Self {
            address,
            port,
            kind: kind.into(),
        }
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let address = self.address.unwrap_or(Ipv4Addr::UNSPECIFIED);
        write!(f, "{}://{}:{}", self.kind, address, self.port)
    }
}

/// Socket details captured before the factory takes ownership of the socket
struct AcceptedSocket {
    peer_addr: Option<SocketAddr>,
    target: Option<String>,
    protocol: &'static str,
}

impl AcceptedSocket {
    fn capture(socket: &dyn ProxySocket) -> Self {
        Self {
            peer_addr: socket.peer_addr(),
            target: socket.target().map(str::to_string),
            protocol: socket.protocol(),
        }
    }
}

impl ProxySocket for AcceptedSocket {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    fn protocol(&self) -> &'static str {
        self.protocol
    }
}

/// Session lifecycle core of a proxy server
pub struct Server<F: TunnelFactory> {
    info: ServerInfo,
    observer: Option<Arc<dyn ServerObserver>>,
    registry: TunnelRegistry,
    factory: F,
    /// Handed to tunnels as their close listener
    me: Weak<Self>,
}

impl<F: TunnelFactory> Server<F> {
    pub fn new(
        info: ServerInfo,
        factory: F,
        observer: Option<Arc<dyn ServerObserver>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            info,
            observer,
            registry: TunnelRegistry::new(),
            factory,
            me: me.clone(),
        })
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Start the server without a transport of its own
    pub fn start(&self) -> Result<(), StartError> {
        self.start_with(|_| Ok(()))
    }

    /// Start the server, running `bind` to set up the underlying transport
    ///
    /// The `started` event is emitted only if `bind` succeeds. On failure the
    /// error is returned unchanged and nothing is emitted or retained.
    pub fn start_with<T>(
        &self,
        bind: impl FnOnce(&ServerInfo) -> Result<T, StartError>,
    ) -> Result<T, StartError> {
        let bound = bind(&self.info)?;
        self.emit(|observer| observer.started(&self.info));
        Ok(bound)
    }

    /// Ask every registered tunnel to close immediately
    ///
    /// Fire-and-forget: the registry is not cleared here and may still hold
    /// entries when this returns. Each tunnel prunes itself through its close
    /// notification. Returns the number of close requests issued.
    pub fn stop(&self) -> usize {
        let tunnels = self.registry.snapshot();
        debug!(
            server = %self.info,
            tunnels = tunnels.len(),
            "Stopping server, force-closing tunnels"
        );

        for tunnel in &tunnels {
            tunnel.force_close();
        }

        self.emit(|observer| observer.stopped(&self.info));
        tunnels.len()
    }

    /// Take ownership of an accepted socket and run a tunnel for it
    ///
    /// Returns as soon as the tunnel has been registered and told to begin.
    /// The returned id is the one the tunnel reports from [`Tunnel::id`].
    pub fn on_accept(&self, socket: F::Socket) -> TunnelId {
        let allocated = TunnelId::new();
        let accepted = AcceptedSocket::capture(&socket);
        let listener: Weak<dyn TunnelCloseListener> = self.me.clone();
        let tunnel = self.factory.create(allocated, socket, listener);

        let id = tunnel.id();
        if id != allocated {
            warn!(
                expected = %allocated,
                actual = %id,
                "Tunnel factory returned a tunnel with a different id"
            );
        }

        self.emit(|observer| observer.new_socket_accepted(&accepted, id, &self.info));

        if !self.registry.insert(tunnel.clone(), accepted.peer_addr, accepted.target) {
            warn!(tunnel_id = %id, "Tunnel id already registered, closing the new tunnel");
            tunnel.force_close();
            return id;
        }
        trace!(tunnel_id = %id, open = self.registry.len(), "Tunnel registered");

        tunnel.begin();
        id
    }

    /// Ask one registered tunnel to close immediately
    ///
    /// Returns `false` if no tunnel is registered under `id`. Like `stop`,
    /// this does not wait and does not prune the registry.
    pub fn force_close(&self, id: &TunnelId) -> bool {
        let Some(tunnel) = self.registry.get(id) else {
            return false;
        };
        debug!(tunnel_id = %id, "Force-closing tunnel");
        tunnel.force_close();
        true
    }

    pub fn tunnel_count(&self) -> usize {
        self.registry.len()
    }

    pub fn contains(&self, id: &TunnelId) -> bool {
        self.registry.contains(id)
    }

    pub fn tunnels(&self) -> Vec<TunnelSummary> {
        self.registry.summaries()
    }

    /// Wait for every tunnel to report its closure, up to `timeout`
    ///
    /// Returns `false` if tunnels are still registered when the timeout
    /// elapses. Nothing is removed or cancelled by this call.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        self.registry.wait_empty(timeout).await
    }

    fn emit(&self, f: impl FnOnce(&dyn ServerObserver)) {
        if let Some(observer) = &self.observer {
            f(observer.as_ref());
        }
    }
}

impl<F: TunnelFactory> TunnelCloseListener for Server<F> {
    fn on_tunnel_closed(&self, tunnel: &dyn Tunnel) {
        self.emit(|observer| observer.tunnel_closed(tunnel, &self.info));

        let id = tunnel.id();
        match self.registry.remove_tunnel(tunnel) {
            Some(_) => trace!(tunnel_id = %id, open = self.registry.len(), "Tunnel pruned"),
            None => trace!(tunnel_id = %id, "Close notification for unregistered tunnel"),
        }
    }
}
