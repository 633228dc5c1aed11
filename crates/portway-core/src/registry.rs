//! Registry of open tunnels
//!
//! Every read and write goes through a single mutex. Critical sections never
//! call into a [`Tunnel`] or an observer: a tunnel may report its closure
//! synchronously from inside `force_close`, and that report needs the lock.

use crate::tunnel::{Tunnel, TunnelId};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

struct TunnelEntry {
    tunnel: Arc<dyn Tunnel>,
    peer_addr: Option<SocketAddr>,
    target: Option<String>,
    registered_at: chrono::DateTime<chrono::Utc>,
}

/// Read-only view of a registered tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelSummary {
    pub id: TunnelId,
    pub peer_addr: Option<SocketAddr>,
    pub target: Option<String>,
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

/// Live set of open tunnels keyed by identity
pub struct TunnelRegistry {
    entries: Mutex<HashMap<TunnelId, TunnelEntry>>,
    /// Current entry count, published on every mutation
    size_tx: watch::Sender<usize>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        let (size_tx, _) = watch::channel(0);
        Self {
            entries: Mutex::new(HashMap::new()),
            size_tx,
        }
    }

    // Each critical section leaves the map consistent, so a poisoned lock
    // still guards valid data.
    fn lock(&self) -> MutexGuard<'_, HashMap<TunnelId, TunnelEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a tunnel
    ///
    /// Returns `false` (and leaves the registry untouched) if a tunnel with
    /// the same id is already present.
    pub fn insert(
        &self,
        tunnel: Arc<dyn Tunnel>,
        peer_addr: Option<SocketAddr>,
        target: Option<String>,
    ) -> bool {
        let id = tunnel.id();
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return false;
        }

        entries.insert(
            id,
            TunnelEntry {
                tunnel,
                peer_addr,
                target,
                registered_at: chrono::Utc::now(),
            },
        );
        self.size_tx.send_replace(entries.len());
        true
    }

    /// Remove a tunnel by id
    ///
    /// Removing an absent tunnel is a no-op and returns `None`. The removed
    /// handle is dropped by the caller, outside the lock.
    pub fn remove(&self, id: &TunnelId) -> Option<Arc<dyn Tunnel>> {
        let mut entries = self.lock();
        let removed = entries.remove(id)?;
        self.size_tx.send_replace(entries.len());
        Some(removed.tunnel)
    }

    /// Remove `tunnel` if it is the instance registered under its id
    ///
    /// A different instance registered under the same id is left in place.
    pub fn remove_tunnel(&self, tunnel: &dyn Tunnel) -> Option<Arc<dyn Tunnel>> {
        let id = tunnel.id();
        let mut entries = self.lock();
        match entries.get(&id) {
            Some(entry) if same_tunnel(entry.tunnel.as_ref(), tunnel) => {}
            _ => return None,
        }
        let removed = entries.remove(&id)?;
        self.size_tx.send_replace(entries.len());
        Some(removed.tunnel)
    }

    /// Handle of the tunnel registered under `id`
    pub fn get(&self, id: &TunnelId) -> Option<Arc<dyn Tunnel>> {
        self.lock().get(id).map(|entry| entry.tunnel.clone())
    }

    pub fn contains(&self, id: &TunnelId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Clone the handles of every registered tunnel
    ///
    /// Callers act on the snapshot after the lock has been released.
    pub fn snapshot(&self) -> Vec<Arc<dyn Tunnel>> {
        self.lock()
            .values()
            .map(|entry| entry.tunnel.clone())
            .collect()
    }

    /// Describe every registered tunnel, oldest first
    pub fn summaries(&self) -> Vec<TunnelSummary> {
        let mut summaries: Vec<TunnelSummary> = self
            .lock()
            .iter()
            .map(|(id, entry)| TunnelSummary {
                id: *id,
                peer_addr: entry.peer_addr,
                target: entry.target.clone(),
                registered_at: entry.registered_at,
            })
            .collect();
        summaries.sort_by_key(|s| s.registered_at);
        summaries
    }

    /// Wait until the registry is empty or `timeout` elapses
    ///
    /// Returns `true` if the registry became (or already was) empty.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let mut size_rx = self.size_tx.subscribe();
        let drained = matches!(
            tokio::time::timeout(timeout, size_rx.wait_for(|len| *len == 0)).await,
            Ok(Ok(_))
        );
        drained
    }
}

/// Instance identity, compared by data pointer only
fn same_tunnel(a: &dyn Tunnel, b: &dyn Tunnel) -> bool {
    std::ptr::eq(a as *const _ as *const (), b as *const _ as *const ())
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
