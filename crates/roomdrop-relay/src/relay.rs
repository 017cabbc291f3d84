//! Relay operations
//!
//! Transport agnostic: the websocket server maps frames onto these calls,
//! tests call them directly.

use roomdrop_config::RelayConfig;
use roomdrop_core::{
    AckResult, ClientRequest, ConnectionId, RelayError, ServerFrame, SessionId,
    StaticTierResolver, TierResolver,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::connections::{ConnectionInfo, ConnectionRegistry};
use crate::now_millis;
use crate::quota::{DailyRoomQuota, RoomQuota};
use crate::session::{JoinOutcome, Session, SessionActor, Signal};
use crate::store::{SessionStore, ShardedSessionStore, StoreError};

/// Attempts at finding a free session code
const CREATE_ATTEMPTS: usize = 8;

/// Result of a successful create
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOutcome {
    pub room_id: SessionId,
    /// Unix millis
    pub expires_at: u64,
}

impl From<CreateOutcome> for AckResult {
    fn from(outcome: CreateOutcome) -> Self {
        AckResult::Created {
            room_id: outcome.room_id,
            expires_at: outcome.expires_at,
        }
    }
}

#[derive(Clone)]
pub struct Relay {
    connections: Arc<ConnectionRegistry>,
    store: Arc<dyn SessionStore>,
    tiers: Arc<dyn TierResolver>,
    quota: Arc<dyn RoomQuota>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            connections: Arc::new(ConnectionRegistry::new()),
            store: Arc::new(ShardedSessionStore::new()),
            tiers: Arc::new(StaticTierResolver::new()),
            quota: Arc::new(DailyRoomQuota::new(config.anonymous_daily_rooms)),
            config,
        }
    }

    /// Replace the session index
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    /// Replace the account tier lookup
    pub fn with_tier_resolver(mut self, tiers: Arc<dyn TierResolver>) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn with_quota(mut self, quota: Arc<dyn RoomQuota>) -> Self {
        self.quota = quota;
        self
    }

    /// Register a client. Frames for it arrive on the returned receiver.
    pub async fn connect(&self, info: ConnectionInfo) -> (ConnectionId, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let id = self.connections.register(info, tx).await;
        (id, rx)
    }

    /// Queue a frame for a client
    pub async fn send_to(&self, conn: ConnectionId, frame: ServerFrame) -> bool {
        self.connections.send(conn, frame).await
    }

    pub async fn create_session(&self, conn: ConnectionId) -> Result<CreateOutcome, RelayError> {
        let info = self
            .connections
            .info(conn)
            .await
            .ok_or(RelayError::UnknownConnection)?;
        let tier = self.tiers.resolve(info.token.as_deref()).await;
        let remaining = self.quota.try_acquire(&info.fingerprint, tier).await?;
        let ttl = self.config.session_ttl(tier);

        for _ in 0..CREATE_ATTEMPTS {
            let id = SessionId::generate();
            let session = Session::new(id.clone(), conn, tier, now_millis(), ttl);
            let expires_at = session.expires_at;
            let (handle, actor) =
                SessionActor::new(session, ttl, self.connections.clone(), self.store.clone());

            match self.store.insert(handle).await {
                Ok(()) => {
                    actor.start();
                    self.connections.track_room(conn, &id).await;
                    info!(
                        "{} created room {} ({} tier, {} left today)",
                        conn, id, tier, remaining
                    );
                    return Ok(CreateOutcome {
                        room_id: id,
                        expires_at,
                    });
                }
                Err(StoreError::Duplicate(_)) => continue,
            }
        }
        Err(RelayError::Rejected("No free room code".to_string()))
    }

    pub async fn join_session(
        &self,
        conn: ConnectionId,
        id: &SessionId,
    ) -> Result<JoinOutcome, RelayError> {
        let handle = self.store.get(id).await.ok_or(RelayError::NotFound)?;
        let outcome = handle.join(conn).await?;
        self.connections.track_room(conn, id).await;
        Ok(outcome)
    }

    /// Forward a signal to the other participant only
    pub async fn relay(
        &self,
        conn: ConnectionId,
        id: &SessionId,
        signal: Signal,
    ) -> Result<(), RelayError> {
        let handle = self.store.get(id).await.ok_or(RelayError::NotFound)?;
        handle.forward(conn, signal).await
    }

    pub async fn leave(&self, conn: ConnectionId, id: &SessionId) -> Result<(), RelayError> {
        let handle = self.store.get(id).await.ok_or(RelayError::NotFound)?;
        handle.leave(conn).await
    }

    /// Close a session. Only its creator may do this.
    pub async fn delete_session(&self, conn: ConnectionId, id: &SessionId) -> Result<(), RelayError> {
        let handle = self.store.get(id).await.ok_or(RelayError::NotFound)?;
        handle.delete(conn).await
    }

    /// Leave every session the connection is part of and forget it
    pub async fn disconnect(&self, conn: ConnectionId) {
        for room in self.connections.unregister(conn).await {
            if let Err(e) = self.leave(conn, &room).await {
                warn!("{} leaving {} on disconnect: {}", conn, room, e);
            }
        }
    }

    pub async fn session(&self, id: &SessionId) -> Option<Session> {
        self.store.get(id).await?.snapshot().await.ok()
    }

    pub async fn session_count(&self) -> usize {
        self.store.len().await
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.len().await
    }

    /// Run one client request and build its acknowledgement
    pub async fn handle_request(&self, conn: ConnectionId, request: ClientRequest) -> AckResult {
        match request {
            ClientRequest::CreateRoom => self.create_session(conn).await.into(),
            ClientRequest::JoinRoom { room_id } => self.join_session(conn, &room_id).await.into(),
            ClientRequest::LeaveRoom { room_id } => {
                self.leave(conn, &room_id).await.map(|()| AckResult::done()).into()
            }
            ClientRequest::DeleteRoom { room_id } => self
                .delete_session(conn, &room_id)
                .await
                .map(|()| AckResult::done())
                .into(),
            ClientRequest::Offer { room_id, payload } => {
                self.relay_ack(conn, &room_id, Signal::Offer(payload)).await
            }
            ClientRequest::Answer { room_id, payload } => {
                self.relay_ack(conn, &room_id, Signal::Answer(payload)).await
            }
            ClientRequest::IceCandidate { room_id, payload } => {
                self.relay_ack(conn, &room_id, Signal::IceCandidate(payload)).await
            }
            ClientRequest::ConnectionReady { room_id } => {
                self.relay_ack(conn, &room_id, Signal::ConnectionReady).await
            }
            ClientRequest::ConnectionEstablished { room_id } => {
                self.relay_ack(conn, &room_id, Signal::ConnectionEstablished).await
            }
        }
    }

    async fn relay_ack(&self, conn: ConnectionId, id: &SessionId, signal: Signal) -> AckResult {
        self.relay(conn, id, signal)
            .await
            .map(|()| AckResult::done())
            .into()
    }
}
