//! TCP front end for the portway proxy
//!
//! Listens for plain TCP connections, performs the HTTP CONNECT handshake and
//! relays each accepted connection through its own tunnel. Session lifecycle
//! (registry, events, stop) is delegated to `portway_core::Server`.

mod handshake;
mod server;
mod tunnel;

pub use handshake::{
    accept_connect, ConnectSocket, HandshakeError, DEFAULT_MAX_HEAD_BYTES, PROTOCOL_HTTP_CONNECT,
};
pub use server::{TcpProxyServer, TcpProxyServerConfig};
pub use tunnel::{RelayConfig, RelayError, RelayTunnel, RelayTunnelFactory};
