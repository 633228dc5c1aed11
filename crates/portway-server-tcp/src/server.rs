//! TCP proxy server
//!
//! Binds a listener, runs the accept loop and the CONNECT handshake, and hands
//! every successfully wrapped socket to the session core.

use crate::handshake::{accept_connect, DEFAULT_MAX_HEAD_BYTES, PROTOCOL_HTTP_CONNECT};
use crate::tunnel::{RelayConfig, RelayTunnelFactory};
use portway_core::{Server, ServerInfo, ServerObserver, StartError, TunnelSummary};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// TCP proxy server configuration
#[derive(Debug, Clone)]
pub struct TcpProxyServerConfig {
    /// Bind address; `None` listens on all interfaces
    pub address: Option<Ipv4Addr>,
    pub port: u16,
    /// Type tag reported to observers
    pub kind: String,
    pub backlog: i32,
    pub handshake_timeout: Duration,
    pub max_head_bytes: usize,
    pub relay: RelayConfig,
}

impl Default for TcpProxyServerConfig {
    fn default() -> Self {
        Self {
            address: Some(Ipv4Addr::LOCALHOST),
            port: 3128,
            kind: PROTOCOL_HTTP_CONNECT.to_string(),
            backlog: 1024,
            handshake_timeout: Duration::from_secs(10),
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
            relay: RelayConfig::default(),
        }
    }
}

impl TcpProxyServerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((self.address.unwrap_or(Ipv4Addr::UNSPECIFIED), self.port))
    }
}

#[derive(Debug, Clone, Copy)]
struct HandshakeSettings {
    max_head_bytes: usize,
    timeout: Duration,
}

/// HTTP CONNECT proxy over plain TCP
pub struct TcpProxyServer {
    config: TcpProxyServerConfig,
    core: Arc<Server<RelayTunnelFactory>>,
    shutdown: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl TcpProxyServer {
    pub fn new(config: TcpProxyServerConfig, observer: Option<Arc<dyn ServerObserver>>) -> Self {
        let info = ServerInfo::new(config.address, config.port, config.kind.clone());
        let factory = RelayTunnelFactory::new(config.relay.clone());
        Self {
            core: Server::new(info, factory, observer),
            config,
            shutdown: CancellationToken::new(),
            local_addr: Mutex::new(None),
        }
    }

    /// Session core, for inspecting the registry
    pub fn core(&self) -> &Arc<Server<RelayTunnelFactory>> {
        &self.core
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tunnels(&self) -> Vec<TunnelSummary> {
        self.core.tunnels()
    }

    /// Bind the listener and spawn the accept loop
    ///
    /// Must be called from within a Tokio runtime. Binding failures are
    /// returned as [`StartError::Bind`] and leave the server unstarted.
    pub fn start(&self) -> Result<SocketAddr, StartError> {
        let mut local_addr = self.local_addr.lock().unwrap_or_else(PoisonError::into_inner);

        let (listener, bound) = self.core.start_with(|_| {
            if local_addr.is_some() {
                return Err(StartError::InvalidConfig(
                    "server is already started".to_string(),
                ));
            }
            if self.shutdown.is_cancelled() {
                return Err(StartError::InvalidConfig(
                    "server has been stopped".to_string(),
                ));
            }
            let listener = bind_listener(self.config.bind_addr(), self.config.backlog)?;
            let bound = listener.local_addr()?;
            Ok((listener, bound))
        })?;
        *local_addr = Some(bound);
        drop(local_addr);

        info!("TCP proxy server listening on {}", bound);

        let settings = HandshakeSettings {
            max_head_bytes: self.config.max_head_bytes,
            timeout: self.config.handshake_timeout,
        };
        tokio::spawn(accept_loop(
            listener,
            self.core.clone(),
            self.shutdown.clone(),
            settings,
        ));

        Ok(bound)
    }

    /// Stop accepting and force-close every open tunnel
    ///
    /// Returns the number of tunnels asked to close. Does not wait for them;
    /// use [`TcpProxyServer::wait_drained`] for that. A handshake finishing
    /// concurrently closes its own tunnel once it sees the shutdown.
    pub fn stop(&self) -> usize {
        self.shutdown.cancel();
        self.core.stop()
    }

    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        self.core.wait_drained(timeout).await
    }
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, StartError> {
    let bind_error = |e: std::io::Error| StartError::Bind {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: e.to_string(),
    };

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;
    socket.listen(backlog).map_err(bind_error)?;

    Ok(TcpListener::from_std(socket.into())?)
}

async fn accept_loop(
    listener: TcpListener,
    core: Arc<Server<RelayTunnelFactory>>,
    shutdown: CancellationToken,
    settings: HandshakeSettings,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                debug!("Accepted TCP connection from {}", peer_addr);
                let core = core.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let handshake = tokio::select! {
                        _ = shutdown.cancelled() => return,
                        result = accept_connect(
                            stream,
                            peer_addr,
                            settings.max_head_bytes,
                            settings.timeout,
                        ) => result,
                    };

                    match handshake {
                        Ok(socket) => {
                            let id = core.on_accept(socket);
                            // stop() may have taken its snapshot before this
                            // tunnel was registered
                            if shutdown.is_cancelled() {
                                core.force_close(&id);
                            }
                        }
                        Err(e) => {
                            debug!("CONNECT handshake with {} failed: {}", peer_addr, e);
                        }
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept TCP connection: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    debug!("Accept loop on {} stopped", core.info());
}
