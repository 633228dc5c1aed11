//! Session lifecycle core for the portway proxy
//!
//! Accepts protocol-wrapped client sockets, runs one tunnel per socket,
//! tracks live tunnels in a registry and reports lifecycle events to an
//! optional observer. Listening, protocol handshakes and byte relaying are
//! provided by the implementations of [`ProxySocket`], [`Tunnel`] and
//! [`TunnelFactory`] (see `portway-server-tcp`).

pub mod error;
pub mod observer;
pub mod registry;
pub mod server;
pub mod tunnel;

pub use error::StartError;
pub use observer::{
    BroadcastObserver, CompositeObserver, ServerEvent, ServerObserver, TracingObserver,
};
pub use registry::{TunnelRegistry, TunnelSummary};
pub use server::{Server, ServerInfo};
pub use tunnel::{ProxySocket, Tunnel, TunnelCloseListener, TunnelFactory, TunnelId};
