//! Relay tunnel for CONNECT sockets
//!
//! Each tunnel runs on its own task: connect upstream, confirm the CONNECT,
//! then copy bytes both ways until either side closes or the tunnel is
//! force-closed. Whatever the outcome, the owner is notified exactly once.

use crate::handshake::ConnectSocket;
use portway_core::{Tunnel, TunnelCloseListener, TunnelFactory, TunnelId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const RESPONSE_GATEWAY_TIMEOUT: &[u8] =
    b"HTTP/1.1 504 Gateway Timeout\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("Connecting to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },
}

/// Relay tunnel settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upper bound for establishing the upstream connection
    pub connect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Bidirectional relay between a CONNECT client and its target
pub struct RelayTunnel {
    id: TunnelId,
    me: Weak<RelayTunnel>,
    /// Taken by the first `begin`
    socket: Mutex<Option<ConnectSocket>>,
    listener: Weak<dyn TunnelCloseListener>,
    cancel: CancellationToken,
    notified: AtomicBool,
    config: RelayConfig,
}

impl RelayTunnel {
    pub fn new(
        id: TunnelId,
        socket: ConnectSocket,
        listener: Weak<dyn TunnelCloseListener>,
        config: RelayConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            socket: Mutex::new(Some(socket)),
            listener,
            cancel: CancellationToken::new(),
            notified: AtomicBool::new(false),
            config,
        })
    }

    /// Whether the close notification has been delivered
    pub fn is_closed(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }

    fn notify_closed(&self) {
        if self.notified.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = self.listener.upgrade() {
            listener.on_tunnel_closed(self);
        }
    }

    /// Returns (client -> target, target -> client) byte counts
    async fn relay(&self, socket: ConnectSocket) -> Result<(u64, u64), RelayError> {
        let (mut client, target, buffered) = socket.into_parts();
        let connect_timeout = self.config.connect_timeout;

        let mut upstream =
            match tokio::time::timeout(connect_timeout, TcpStream::connect(&target)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    let _ = client.write_all(RESPONSE_BAD_GATEWAY).await;
                    return Err(RelayError::Connect {
                        target,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    let _ = client.write_all(RESPONSE_GATEWAY_TIMEOUT).await;
                    return Err(RelayError::ConnectTimeout {
                        target,
                        timeout: connect_timeout,
                    });
                }
            };

        client.write_all(RESPONSE_ESTABLISHED).await?;
        if !buffered.is_empty() {
            upstream.write_all(&buffered).await?;
        }

        let (to_target, to_client) =
            tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        Ok((to_target + buffered.len() as u64, to_client))
    }
}

impl Tunnel for RelayTunnel {
    fn id(&self) -> TunnelId {
        self.id
    }

    fn begin(&self) {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(socket) = socket else {
            warn!(tunnel_id = %self.id, "Tunnel already started");
            return;
        };
        let Some(this) = self.me.upgrade() else {
            self.notify_closed();
            return;
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(tunnel_id = %self.id, "Cannot start tunnel outside a Tokio runtime: {}", e);
                self.notify_closed();
                return;
            }
        };

        runtime.spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = this.cancel.cancelled() => None,
                result = this.relay(socket) => Some(result),
            };

            match outcome {
                None => debug!(tunnel_id = %this.id, "Tunnel force-closed"),
                Some(Ok((to_target, to_client))) => debug!(
                    tunnel_id = %this.id,
                    to_target,
                    to_client,
                    "Tunnel finished"
                ),
                Some(Err(e)) => debug!(tunnel_id = %this.id, error = %e, "Tunnel failed"),
            }

            this.notify_closed();
        });
    }

    fn force_close(&self) {
        self.cancel.cancel();
    }
}

/// Builds a [`RelayTunnel`] for every accepted CONNECT socket
#[derive(Debug, Clone, Default)]
pub struct RelayTunnelFactory {
    config: RelayConfig,
}

impl RelayTunnelFactory {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

impl TunnelFactory for RelayTunnelFactory {
    type Socket = ConnectSocket;

    fn create(
        &self,
        id: TunnelId,
        socket: ConnectSocket,
        listener: Weak<dyn TunnelCloseListener>,
    ) -> Arc<dyn Tunnel> {
        RelayTunnel::new(id, socket, listener, self.config.clone())
    }
}
