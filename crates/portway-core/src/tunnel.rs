//! Tunnel and proxy socket contracts
//!
//! The server never relays bytes itself. It hands each [`ProxySocket`] to a
//! [`TunnelFactory`], drives the resulting [`Tunnel`] through `begin` and
//! `force_close`, and waits for the tunnel to report its closure through the
//! [`TunnelCloseListener`] it was given at creation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Unique tunnel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(Uuid);

impl TunnelId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TunnelId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TunnelId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A client connection already wrapped by a protocol handshake
pub trait ProxySocket: Send + 'static {
    /// Address of the connecting client, when known
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Destination requested by the client (e.g. "example.com:443")
    fn target(&self) -> Option<&str> {
        None
    }

    /// Short protocol label used in logs and events (e.g. "http-connect")
    fn protocol(&self) -> &'static str;
}

/// One client <-> remote relay
///
/// Implementations must report their closure exactly once through the
/// [`TunnelCloseListener`] handed to them by the factory, whatever the cause
/// (normal completion, error, or `force_close`).
#[cfg_attr(test, mockall::automock)]
pub trait Tunnel: Send + Sync {
    fn id(&self) -> TunnelId;

    /// Start relaying. Must return immediately; the relay runs on its own task.
    fn begin(&self);

    /// Request immediate termination. Must not block waiting for the relay.
    fn force_close(&self);
}

/// Capability a tunnel uses to report that it has closed
///
/// May be invoked from any thread. Implementations must tolerate duplicate
/// notifications for the same tunnel.
pub trait TunnelCloseListener: Send + Sync {
    fn on_tunnel_closed(&self, tunnel: &dyn Tunnel);
}

/// Builds tunnels around accepted sockets
pub trait TunnelFactory: Send + Sync + 'static {
    type Socket: ProxySocket;

    /// Wrap `socket` in a new tunnel identified by `id`
    ///
    /// The returned tunnel must report `id` from [`Tunnel::id`] and must not
    /// start relaying until [`Tunnel::begin`] is called. `listener` is a
    /// non-owning back-reference to the server.
    fn create(
        &self,
        id: TunnelId,
        socket: Self::Socket,
        listener: Weak<dyn TunnelCloseListener>,
    ) -> Arc<dyn Tunnel>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tunnel_ids_are_unique() {
        let ids: HashSet<TunnelId> = (0..1000).map(|_| TunnelId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_tunnel_id_display_matches_uuid() {
        let uuid = Uuid::new_v4();
        let id = TunnelId::from(uuid);
        assert_eq!(id.to_string(), uuid.to_string());
        assert_eq!(id.as_uuid(), &uuid);
    }

    #[test]
    fn test_tunnel_id_serializes_as_plain_string() {
        let id = TunnelId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }
}
