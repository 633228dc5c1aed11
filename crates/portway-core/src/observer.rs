//! Lifecycle observers
//!
//! Observers are injected into the server at construction. Every callback is
//! invoked outside the registry lock, so an observer may query the server.

use crate::server::ServerInfo;
use crate::tunnel::{ProxySocket, Tunnel, TunnelId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Sink for server lifecycle events
///
/// For any tunnel, `new_socket_accepted` is always delivered before the
/// matching `tunnel_closed`.
pub trait ServerObserver: Send + Sync {
    fn started(&self, _server: &ServerInfo) {}

    fn stopped(&self, _server: &ServerInfo) {}

    fn new_socket_accepted(
        &self,
        _socket: &dyn ProxySocket,
        _tunnel_id: TunnelId,
        _server: &ServerInfo,
    ) {
    }

    fn tunnel_closed(&self, _tunnel: &dyn Tunnel, _server: &ServerInfo) {}
}

/// Owned lifecycle event, for consumers that want a stream instead of callbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Started {
        server: ServerInfo,
    },
    Stopped {
        server: ServerInfo,
    },
    NewSocketAccepted {
        tunnel_id: TunnelId,
        protocol: String,
        peer_addr: Option<SocketAddr>,
        target: Option<String>,
        server: ServerInfo,
    },
    TunnelClosed {
        tunnel_id: TunnelId,
        server: ServerInfo,
    },
}

impl ServerEvent {
    /// Tunnel the event refers to, if any
    pub fn tunnel_id(&self) -> Option<TunnelId> {
        match self {
            ServerEvent::NewSocketAccepted { tunnel_id, .. }
            | ServerEvent::TunnelClosed { tunnel_id, .. } => Some(*tunnel_id),
            ServerEvent::Started { .. } | ServerEvent::Stopped { .. } => None,
        }
    }

    pub fn accepted(socket: &dyn ProxySocket, tunnel_id: TunnelId, server: &ServerInfo) -> Self {
        ServerEvent::NewSocketAccepted {
            tunnel_id,
            protocol: socket.protocol().to_string(),
            peer_addr: socket.peer_addr(),
            target: socket.target().map(str::to_string),
            server: server.clone(),
        }
    }
}

/// Writes every lifecycle event to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ServerObserver for TracingObserver {
    fn started(&self, server: &ServerInfo) {
        info!(server = %server, "Proxy server started");
    }

    fn stopped(&self, server: &ServerInfo) {
        info!(server = %server, "Proxy server stopped");
    }

    fn new_socket_accepted(
        &self,
        socket: &dyn ProxySocket,
        tunnel_id: TunnelId,
        server: &ServerInfo,
    ) {
        info!(
            server = %server,
            tunnel_id = %tunnel_id,
            protocol = socket.protocol(),
            peer = ?socket.peer_addr(),
            target = socket.target().unwrap_or("-"),
            "New socket accepted"
        );
    }

    fn tunnel_closed(&self, tunnel: &dyn Tunnel, server: &ServerInfo) {
        debug!(server = %server, tunnel_id = %tunnel.id(), "Tunnel closed");
    }
}

/// Publishes every lifecycle event on a broadcast channel
///
/// Events are dropped silently while there are no subscribers. Slow
/// subscribers observe `RecvError::Lagged` rather than blocking the server.
#[derive(Clone)]
pub struct BroadcastObserver {
    event_tx: broadcast::Sender<ServerEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self { event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    fn publish(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl ServerObserver for BroadcastObserver {
    fn started(&self, server: &ServerInfo) {
        self.publish(ServerEvent::Started {
            server: server.clone(),
        });
    }

    fn stopped(&self, server: &ServerInfo) {
        self.publish(ServerEvent::Stopped {
            server: server.clone(),
        });
    }

    fn new_socket_accepted(
        &self,
        socket: &dyn ProxySocket,
        tunnel_id: TunnelId,
        server: &ServerInfo,
    ) {
        self.publish(ServerEvent::accepted(socket, tunnel_id, server));
    }

    fn tunnel_closed(&self, tunnel: &dyn Tunnel, server: &ServerInfo) {
        self.publish(ServerEvent::TunnelClosed {
            tunnel_id: tunnel.id(),
            server: server.clone(),
        });
    }
}

/// Fans each event out to several observers, in registration order
#[derive(Clone, Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn ServerObserver>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn ServerObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl ServerObserver for CompositeObserver {
    fn started(&self, server: &ServerInfo) {
        for observer in &self.observers {
            observer.started(server);
        }
    }

    fn stopped(&self, server: &ServerInfo) {
        for observer in &self.observers {
            observer.stopped(server);
        }
    }

    fn new_socket_accepted(
        &self,
        socket: &dyn ProxySocket,
        tunnel_id: TunnelId,
        server: &ServerInfo,
    ) {
        for observer in &self.observers {
            observer.new_socket_accepted(socket, tunnel_id, server);
        }
    }

    fn tunnel_closed(&self, tunnel: &dyn Tunnel, server: &ServerInfo) {
        for observer in &self.observers {
            observer.tunnel_closed(tunnel, server);
        }
    }
}
