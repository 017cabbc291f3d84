//! Session index
//!
//! The relay only needs get/insert/remove by session id. The default store
//! splits the index into independently locked shards so lookups for
//! different sessions do not serialize on one lock.

use async_trait::async_trait;
use roomdrop_core::SessionId;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::session::SessionHandle;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Session {0} already exists")]
    Duplicate(SessionId),
}

/// Index of live sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &SessionId) -> Option<SessionHandle>;

    /// Fails with [`StoreError::Duplicate`] if the id is taken
    async fn insert(&self, handle: SessionHandle) -> Result<(), StoreError>;

    async fn remove(&self, id: &SessionId) -> Option<SessionHandle>;

    async fn len(&self) -> usize;
}

#[async_trait]
impl<T: SessionStore + ?Sized> SessionStore for Arc<T> {
    async fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        (**self).get(id).await
    }

    async fn insert(&self, handle: SessionHandle) -> Result<(), StoreError> {
        (**self).insert(handle).await
    }

    async fn remove(&self, id: &SessionId) -> Option<SessionHandle> {
        (**self).remove(id).await
    }

    async fn len(&self) -> usize {
        (**self).len().await
    }
}

const DEFAULT_SHARDS: usize = 16;

/// In-memory store with per-shard locks
pub struct ShardedSessionStore {
    shards: Vec<RwLock<HashMap<SessionId, SessionHandle>>>,
}

impl ShardedSessionStore {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(count: usize) -> Self {
        let count = count.max(1);
        Self {
            shards: (0..count).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, id: &SessionId) -> &RwLock<HashMap<SessionId, SessionHandle>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }
}

impl Default for ShardedSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for ShardedSessionStore {
    async fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.shard(id).read().await.get(id).cloned()
    }

    async fn insert(&self, handle: SessionHandle) -> Result<(), StoreError> {
        let mut shard = self.shard(handle.id()).write().await;
        if shard.contains_key(handle.id()) {
            return Err(StoreError::Duplicate(handle.id().clone()));
        }
        shard.insert(handle.id().clone(), handle);
        Ok(())
    }

    async fn remove(&self, id: &SessionId) -> Option<SessionHandle> {
        self.shard(id).write().await.remove(id)
    }

    async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().await.len();
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionRegistry;
    use crate::session::{Session, SessionActor};
    use roomdrop_core::{ConnectionId, Tier};
    use std::time::Duration;

    fn handle_for(id: &str, store: Arc<dyn SessionStore>) -> SessionHandle {
        let session = Session::new(
            SessionId::new(id),
            ConnectionId(1),
            Tier::Anonymous,
            0,
            Duration::from_secs(60),
        );
        let (handle, _actor) = SessionActor::new(
            session,
            Duration::from_secs(60),
            Arc::new(ConnectionRegistry::new()),
            store,
        );
        handle
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let store = Arc::new(ShardedSessionStore::with_shards(4));
        let handle = handle_for("AAAA1111", store.clone());

        store.insert(handle.clone()).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert!(store.get(&SessionId::new("AAAA1111")).await.is_some());
        assert!(store.get(&SessionId::new("BBBB2222")).await.is_none());

        assert!(store.remove(&SessionId::new("AAAA1111")).await.is_some());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let store = Arc::new(ShardedSessionStore::new());
        store
            .insert(handle_for("CCCC3333", store.clone()))
            .await
            .unwrap();
        let err = store
            .insert(handle_for("CCCC3333", store.clone()))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Duplicate(SessionId::new("CCCC3333")));
    }

    #[tokio::test]
    async fn test_ids_spread_across_shards() {
        let store = Arc::new(ShardedSessionStore::with_shards(8));
        for _ in 0..64 {
            store
                .insert(handle_for(SessionId::generate().as_str(), store.clone()))
                .await
                .unwrap();
        }
        let mut used = 0;
        for shard in &store.shards {
            if !shard.read().await.is_empty() {
                used += 1;
            }
        }
        assert!(used > 1);
    }
}
