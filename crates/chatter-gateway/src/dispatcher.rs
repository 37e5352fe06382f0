use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use chatter_types::events::ServerEvent;

/// The broadcaster: owns every live connection's outbound channel and
/// resolves a delivery scope (requester only, everyone-but-requester,
/// everyone, per-user subset) to the right set of connections.
///
/// Delivery is fire-and-forget, at-most-once: a connection whose receiver is
/// gone simply misses the event and resyncs later via ListChats/ListUsers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct ConnectionHandle {
    tx: mpsc::UnboundedSender<ServerEvent>,
    /// User name bound at login or presence registration; anonymous before.
    user_name: Option<String>,
}

struct DispatcherInner {
    connections: RwLock<HashMap<Uuid, ConnectionHandle>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Admit a new connection. Returns its server-assigned identity and the
    /// receiver the connection's send task drains.
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.connections.write().await.insert(
            conn_id,
            ConnectionHandle {
                tx,
                user_name: None,
            },
        );
        (conn_id, rx)
    }

    pub async fn unregister(&self, conn_id: Uuid) {
        self.inner.connections.write().await.remove(&conn_id);
    }

    /// Bind a connection to a user name so per-user scopes (DM legs, memo
    /// fan-out) can resolve it.
    pub async fn bind_user(&self, conn_id: Uuid, user_name: &str) {
        let mut connections = self.inner.connections.write().await;
        if let Some(handle) = connections.get_mut(&conn_id) {
            handle.user_name = Some(user_name.to_string());
        }
    }

    /// Drop the binding from every connection holding `user_name`. Explicit
    /// logout: the connections stay open but go back to anonymous, so
    /// per-user scopes stop resolving them.
    pub async fn unbind_user(&self, user_name: &str) {
        let mut connections = self.inner.connections.write().await;
        for handle in connections.values_mut() {
            if handle.user_name.as_deref() == Some(user_name) {
                handle.user_name = None;
            }
        }
    }

    /// Requester-only scope.
    pub async fn send_to(&self, conn_id: Uuid, event: ServerEvent) {
        let connections = self.inner.connections.read().await;
        if let Some(handle) = connections.get(&conn_id) {
            let _ = handle.tx.send(event);
        }
    }

    /// Everyone scope.
    pub async fn broadcast(&self, event: ServerEvent) {
        let connections = self.inner.connections.read().await;
        for handle in connections.values() {
            let _ = handle.tx.send(event.clone());
        }
    }

    /// Everyone-but-requester scope.
    pub async fn broadcast_except(&self, conn_id: Uuid, event: ServerEvent) {
        let connections = self.inner.connections.read().await;
        for (&id, handle) in connections.iter() {
            if id != conn_id {
                let _ = handle.tx.send(event.clone());
            }
        }
    }

    /// Per-user scope: every live connection bound to `user_name`.
    /// Returns how many connections were hit.
    pub async fn send_to_user(&self, user_name: &str, event: ServerEvent) -> usize {
        let connections = self.inner.connections.read().await;
        let mut delivered = 0;
        for handle in connections.values() {
            if handle.user_name.as_deref() == Some(user_name) {
                let _ = handle.tx.send(event.clone());
                delivered += 1;
            }
        }
        delivered
    }

    /// Author scope: the requesting connection plus every other connection
    /// bound to the author's name, each hit once.
    pub async fn send_to_author(&self, conn_id: Uuid, user_name: &str, event: ServerEvent) {
        let connections = self.inner.connections.read().await;
        for (&id, handle) in connections.iter() {
            if id == conn_id || handle.user_name.as_deref() == Some(user_name) {
                let _ = handle.tx.send(event.clone());
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
