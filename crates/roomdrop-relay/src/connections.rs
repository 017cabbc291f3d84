//! Registry of live websocket connections
//!
//! Each connection owns a bounded outbound queue. Session tasks push
//! events into it; the websocket writer drains it.

use roomdrop_core::{ConnectionId, ServerFrame, SessionId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// What the relay knows about a client
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// Device fingerprint used for room quotas
    pub fingerprint: String,
    /// Account credential, if the client presented one
    pub token: Option<String>,
}

struct Connection {
    tx: mpsc::Sender<ServerFrame>,
    info: ConnectionInfo,
    rooms: HashSet<SessionId>,
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn register(
        &self,
        info: ConnectionInfo,
        tx: mpsc::Sender<ServerFrame>,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut connections = self.connections.write().await;
        connections.insert(
            id,
            Connection {
                tx,
                info,
                rooms: HashSet::new(),
            },
        );
        debug!("{} registered, total: {}", id, connections.len());
        id
    }

    /// Drop a connection, returning the sessions it was part of
    pub async fn unregister(&self, id: ConnectionId) -> Vec<SessionId> {
        let mut connections = self.connections.write().await;
        let rooms = connections
            .remove(&id)
            .map(|c| c.rooms.into_iter().collect())
            .unwrap_or_default();
        debug!("{} unregistered, total: {}", id, connections.len());
        rooms
    }

    pub async fn info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.read().await.get(&id).map(|c| c.info.clone())
    }

    /// Queue a frame for a connection. Returns false if it is gone.
    pub async fn send(&self, id: ConnectionId, frame: ServerFrame) -> bool {
        let tx = match self.connections.read().await.get(&id) {
            Some(c) => c.tx.clone(),
            None => return false,
        };
        tx.send(frame).await.is_ok()
    }

    pub async fn track_room(&self, id: ConnectionId, room: &SessionId) {
        if let Some(c) = self.connections.write().await.get_mut(&id) {
            c.rooms.insert(room.clone());
        }
    }

    pub async fn forget_room(&self, id: ConnectionId, room: &SessionId) {
        if let Some(c) = self.connections.write().await.get_mut(&id) {
            c.rooms.remove(room);
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomdrop_core::RelayEvent;

    #[tokio::test]
    async fn test_register_unregister() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);

        let id1 = registry.register(ConnectionInfo::default(), tx1).await;
        let id2 = registry.register(ConnectionInfo::default(), tx2).await;
        assert_eq!(id1, ConnectionId(1));
        assert_eq!(id2, ConnectionId(2));
        assert_eq!(registry.len().await, 2);

        let room = SessionId::new("AB12CD34");
        registry.track_room(id1, &room).await;
        assert_eq!(registry.unregister(id1).await, vec![room]);
        assert_eq!(registry.len().await, 1);
        assert!(registry.info(id1).await.is_none());
    }

    #[tokio::test]
    async fn test_send_to_missing_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        let id = registry.register(ConnectionInfo::default(), tx).await;

        let frame = ServerFrame::Event(RelayEvent::UserLeft { user_id: id });
        assert!(registry.send(id, frame.clone()).await);
        assert_eq!(rx.recv().await, Some(frame.clone()));

        assert!(!registry.send(ConnectionId(99), frame).await);
    }
}
