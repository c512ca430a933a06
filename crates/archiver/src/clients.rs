//! Connected client registry, reported by the `CI` command

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    id: u64,
    pub connected: DateTime<Utc>,
    pub name: String,
    pub command: String,
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {}",
            self.connected.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.name,
            self.command
        )
    }
}

#[derive(Debug, Default)]
struct Registry {
    next_id: AtomicU64,
    clients: Mutex<Vec<ClientInfo>>,
}

/// Clients currently being served
#[derive(Debug, Clone, Default)]
pub struct ClientList {
    inner: Arc<Registry>,
}

impl ClientList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a client until the returned guard is dropped.
    pub fn register(&self, name: &str, command: &str) -> ClientGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.clients.lock().push(ClientInfo {
            id,
            connected: Utc::now(),
            name: name.to_string(),
            command: command.to_string(),
        });
        metrics::gauge!("fa_clients_connected").increment(1.0);
        ClientGuard {
            id,
            list: self.clone(),
        }
    }

    /// Clients in order of connection.
    pub fn snapshot(&self) -> Vec<ClientInfo> {
        self.inner.clients.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.inner.clients.lock().retain(|client| client.id != id);
        metrics::gauge!("fa_clients_connected").decrement(1.0);
    }
}

/// Removes its client from the list on drop
#[derive(Debug)]
pub struct ClientGuard {
    id: u64,
    list: ClientList,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.list.remove(self.id);
    }
}
