//! Session actor
//!
//! Every session is owned by one task. Join, leave, relay and delete are
//! messages to that task, so the participant list has a single writer and
//! sessions never contend with each other.

use roomdrop_core::{
    AckResult, ConnectionId, RelayError, RelayEvent, Role, ServerFrame, SessionId, Tier,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::connections::ConnectionRegistry;
use crate::store::SessionStore;

/// Sessions pair exactly two peers
pub const MAX_PARTICIPANTS: usize = 2;

const COMMAND_BUFFER: usize = 32;

/// Snapshot of a session's state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub creator: ConnectionId,
    /// Holder of the impolite seat, if present
    pub initiator: Option<ConnectionId>,
    pub participants: Vec<ConnectionId>,
    pub tier: Tier,
    /// Unix millis
    pub created_at: u64,
    /// Unix millis
    pub expires_at: u64,
    pub live: bool,
}

impl Session {
    pub fn new(id: SessionId, creator: ConnectionId, tier: Tier, created_at: u64, ttl: Duration) -> Self {
        Self {
            id,
            creator,
            initiator: Some(creator),
            participants: vec![creator],
            tier,
            created_at,
            expires_at: created_at
                .saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
            live: true,
        }
    }

    pub fn role_of(&self, conn: ConnectionId) -> Option<Role> {
        if !self.participants.contains(&conn) {
            return None;
        }
        if self.initiator == Some(conn) {
            Some(Role::Initiator)
        } else {
            Some(Role::Responder)
        }
    }

    fn others(&self, conn: ConnectionId) -> Vec<ConnectionId> {
        self.participants
            .iter()
            .copied()
            .filter(|p| *p != conn)
            .collect()
    }
}

/// Result of a successful join
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub role: Role,
    pub participants: Vec<ConnectionId>,
}

impl From<JoinOutcome> for AckResult {
    fn from(outcome: JoinOutcome) -> Self {
        AckResult::Joined {
            success: true,
            role: outcome.role,
            participants: outcome.participants,
        }
    }
}

/// Opaque negotiation traffic and connection notices forwarded between peers
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer(Value),
    Answer(Value),
    IceCandidate(Value),
    ConnectionReady,
    ConnectionEstablished,
}

impl Signal {
    fn into_event(self, from: ConnectionId) -> RelayEvent {
        match self {
            Signal::Offer(payload) => RelayEvent::Offer { from, payload },
            Signal::Answer(payload) => RelayEvent::Answer { from, payload },
            Signal::IceCandidate(payload) => RelayEvent::IceCandidate { from, payload },
            Signal::ConnectionReady => RelayEvent::PeerConnectionReady { from },
            Signal::ConnectionEstablished => RelayEvent::PeerConnected { from },
        }
    }
}

/// `now + ttl`, pushed out to a far but representable instant on overflow
fn deadline_after(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

type Reply<T> = oneshot::Sender<Result<T, RelayError>>;

pub(crate) enum SessionCommand {
    Join { conn: ConnectionId, reply: Reply<JoinOutcome> },
    Leave { conn: ConnectionId, reply: Reply<()> },
    Forward { from: ConnectionId, signal: Signal, reply: Reply<()> },
    Delete { conn: ConnectionId, reply: Reply<()> },
    Snapshot { reply: Reply<Session> },
}

/// Address of a running session task
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Whether the session task has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, RelayError> {
        let (reply, rx) = oneshot::channel();
        // A stopped task means the session was closed under us
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| RelayError::Closed)?;
        rx.await.map_err(|_| RelayError::Closed)?
    }

    pub async fn join(&self, conn: ConnectionId) -> Result<JoinOutcome, RelayError> {
        self.request(|reply| SessionCommand::Join { conn, reply }).await
    }

    pub async fn leave(&self, conn: ConnectionId) -> Result<(), RelayError> {
        self.request(|reply| SessionCommand::Leave { conn, reply }).await
    }

    pub async fn forward(&self, from: ConnectionId, signal: Signal) -> Result<(), RelayError> {
        self.request(|reply| SessionCommand::Forward {
            from,
            signal,
            reply,
        })
        .await
    }

    pub async fn delete(&self, conn: ConnectionId) -> Result<(), RelayError> {
        self.request(|reply| SessionCommand::Delete { conn, reply }).await
    }

    pub async fn snapshot(&self) -> Result<Session, RelayError> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

pub(crate) struct SessionActor {
    session: Session,
    rx: mpsc::Receiver<SessionCommand>,
    connections: Arc<ConnectionRegistry>,
    store: Arc<dyn SessionStore>,
    deadline: Instant,
}

impl SessionActor {
    /// Build the task owning `session` without starting it, so the caller
    /// can index the handle first. Once started the task stops on expiry,
    /// deletion, when the last participant leaves, or when every handle is
    /// dropped.
    pub(crate) fn new(
        session: Session,
        ttl: Duration,
        connections: Arc<ConnectionRegistry>,
        store: Arc<dyn SessionStore>,
    ) -> (SessionHandle, SessionActor) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = SessionHandle {
            id: session.id.clone(),
            tx,
        };
        let actor = SessionActor {
            session,
            rx,
            connections,
            store,
            deadline: deadline_after(ttl),
        };
        (handle, actor)
    }

    pub(crate) fn start(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        let expiry = sleep_until(self.deadline);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle(cmd).await == Flow::Stop {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut expiry => {
                    info!("Room {} expired", self.session.id);
                    let event = RelayEvent::RoomExpired { room_id: self.session.id.clone() };
                    self.notify(&self.session.participants.clone(), event).await;
                    break;
                }
            }
        }

        self.session.live = false;
        self.store.remove(&self.session.id).await;
        for conn in &self.session.participants {
            self.connections.forget_room(*conn, &self.session.id).await;
        }
        debug!("Room {} task stopped", self.session.id);
    }

    async fn handle(&mut self, cmd: SessionCommand) -> Flow {
        match cmd {
            SessionCommand::Join { conn, reply } => {
                let _ = reply.send(self.join(conn).await);
                Flow::Continue
            }
            SessionCommand::Leave { conn, reply } => {
                let result = self.leave(conn).await;
                let empty = self.session.participants.is_empty();
                let _ = reply.send(result);
                if empty {
                    info!("Room {} empty, removing", self.session.id);
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
            SessionCommand::Forward {
                from,
                signal,
                reply,
            } => {
                let _ = reply.send(self.forward(from, signal).await);
                Flow::Continue
            }
            SessionCommand::Delete { conn, reply } => {
                if conn != self.session.creator {
                    let _ = reply.send(Err(RelayError::PermissionDenied));
                    return Flow::Continue;
                }
                let event = RelayEvent::RoomClosed {
                    room_id: self.session.id.clone(),
                };
                self.notify(&self.session.others(conn), event).await;
                info!("Room {} deleted by creator", self.session.id);
                let _ = reply.send(Ok(()));
                Flow::Stop
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(Ok(self.session.clone()));
                Flow::Continue
            }
        }
    }

    async fn join(&mut self, conn: ConnectionId) -> Result<JoinOutcome, RelayError> {
        if let Some(role) = self.session.role_of(conn) {
            return Ok(JoinOutcome {
                role,
                participants: self.session.participants.clone(),
            });
        }
        if self.session.participants.len() >= MAX_PARTICIPANTS {
            return Err(RelayError::Full);
        }

        let others = self.session.others(conn);
        self.session.participants.push(conn);
        if self.session.initiator.is_none() {
            self.session.initiator = Some(conn);
        }
        self.notify(&others, RelayEvent::UserJoined { user_id: conn })
            .await;

        let role = self.session.role_of(conn).unwrap_or(Role::Responder);
        info!("{} joined room {} as {:?}", conn, self.session.id, role);
        Ok(JoinOutcome {
            role,
            participants: self.session.participants.clone(),
        })
    }

    async fn leave(&mut self, conn: ConnectionId) -> Result<(), RelayError> {
        if !self.session.participants.contains(&conn) {
            return Err(RelayError::NotParticipant);
        }
        self.session.participants.retain(|p| *p != conn);
        if self.session.initiator == Some(conn) {
            self.session.initiator = None;
        }
        self.connections.forget_room(conn, &self.session.id).await;
        let others = self.session.participants.clone();
        self.notify(&others, RelayEvent::UserLeft { user_id: conn })
            .await;
        info!("{} left room {}", conn, self.session.id);
        Ok(())
    }

    async fn forward(&mut self, from: ConnectionId, signal: Signal) -> Result<(), RelayError> {
        if !self.session.participants.contains(&from) {
            return Err(RelayError::NotParticipant);
        }
        let event = signal.into_event(from);
        debug!("Relaying {} in room {}", event_name(&event), self.session.id);
        self.notify(&self.session.others(from), event).await;
        Ok(())
    }

    async fn notify(&self, targets: &[ConnectionId], event: RelayEvent) {
        for target in targets {
            if !self
                .connections
                .send(*target, ServerFrame::Event(event.clone()))
                .await
            {
                debug!("{} gone, dropping event for room {}", target, self.session.id);
            }
        }
    }
}

fn event_name(event: &RelayEvent) -> &'static str {
    match event {
        RelayEvent::Offer { .. } => "offer",
        RelayEvent::Answer { .. } => "answer",
        RelayEvent::IceCandidate { .. } => "ice-candidate",
        RelayEvent::PeerConnectionReady { .. } => "peer-connection-ready",
        RelayEvent::PeerConnected { .. } => "peer-connected",
        _ => "event",
    }
}
