//! Websocket client for the signaling relay
//!
//! Requests carry an id and resolve when the matching acknowledgement
//! arrives; everything else the relay pushes is handed out as
//! [`RelayEvent`]s in arrival order. Negotiation signals are sent
//! fire-and-forget through the [`SignalSink`] impl.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use roomdrop_core::{
    AckResult, ClientFrame, ClientRequest, ConnectionId, RelayError, RelayEvent, Role,
    ServerFrame, SessionId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::transport::{OutboundSignal, SdpKind, SignalSink, TransportError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("Relay connection closed")]
    Disconnected,
    #[error("Not in a room")]
    NoRoom,
    #[error("Unexpected reply: {0:?}")]
    UnexpectedReply(AckResult),
}

/// Room joined through [`RelayClient::join_room`]
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRoom {
    pub role: Role,
    pub participants: Vec<ConnectionId>,
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<AckResult>>>>;

struct ClientInner {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingAcks,
    /// Set by either socket task on exit, before `pending` is cleared
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    room: RwLock<Option<SessionId>>,
}

#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

impl RelayClient {
    /// Connect to `ws://host/ws?...`. The receiver yields relay events
    /// until the socket closes.
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RelayEvent>), ClientError> {
        info!("Connecting to relay: {}", url);
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer_pending = pending.clone();
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    warn!("Relay send failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            writer_closed.store(true, Ordering::SeqCst);
            writer_pending.lock().await.clear();
        });

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Relay socket error: {}", e);
                        break;
                    }
                };
                match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::Ack { ack, result }) => {
                        if let Some(tx) = reader_pending.lock().await.remove(&ack) {
                            let _ = tx.send(result);
                        }
                    }
                    Ok(ServerFrame::Event(event)) => {
                        if events_tx.send(event).is_err() {
                            debug!("Relay event receiver dropped");
                        }
                    }
                    Err(e) => warn!("Unparseable relay frame: {}", e),
                }
            }
            debug!("Relay socket closed");
            reader_closed.store(true, Ordering::SeqCst);
            // Dropping the senders fails every request still waiting
            reader_pending.lock().await.clear();
        });

        let client = Self {
            inner: Arc::new(ClientInner {
                outgoing,
                pending,
                closed,
                next_id: AtomicU64::new(1),
                room: RwLock::new(None),
            }),
        };
        Ok((client, events_rx))
    }

    /// Send a request and wait for its acknowledgement
    async fn request(&self, request: ClientRequest) -> Result<AckResult, ClientError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);
        // A close after this point drops `tx`; one before it is seen here
        if self.is_closed() {
            self.inner.pending.lock().await.remove(&id);
            return Err(ClientError::Disconnected);
        }

        if let Err(e) = self.send(ClientFrame {
            id: Some(id),
            request,
        }) {
            self.inner.pending.lock().await.remove(&id);
            return Err(e);
        }
        let result = rx.await.map_err(|_| ClientError::Disconnected)?;
        Ok(result.into_result()?)
    }

    fn send(&self, frame: ClientFrame) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Disconnected);
        }
        let text = serde_json::to_string(&frame)?;
        self.inner
            .outgoing
            .send(Message::Text(text))
            .map_err(|_| ClientError::Disconnected)
    }

    /// The relay socket is gone; every request fails with `Disconnected`
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub async fn room(&self) -> Option<SessionId> {
        self.inner.room.read().await.clone()
    }

    async fn current_room(&self) -> Result<SessionId, ClientError> {
        self.room().await.ok_or(ClientError::NoRoom)
    }

    /// Create a room. Returns its code and expiry in unix millis.
    pub async fn create_room(&self) -> Result<(SessionId, u64), ClientError> {
        match self.request(ClientRequest::CreateRoom).await? {
            AckResult::Created {
                room_id,
                expires_at,
            } => {
                info!("Created room {}", room_id);
                *self.inner.room.write().await = Some(room_id.clone());
                Ok((room_id, expires_at))
            }
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    pub async fn join_room(&self, room_id: &SessionId) -> Result<JoinedRoom, ClientError> {
        let reply = self
            .request(ClientRequest::JoinRoom {
                room_id: room_id.clone(),
            })
            .await?;
        match reply {
            AckResult::Joined {
                role, participants, ..
            } => {
                info!("Joined room {} as {:?}", room_id, role);
                *self.inner.room.write().await = Some(room_id.clone());
                Ok(JoinedRoom { role, participants })
            }
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    pub async fn leave_room(&self) -> Result<(), ClientError> {
        let room_id = self.current_room().await?;
        self.request(ClientRequest::LeaveRoom { room_id }).await?;
        *self.inner.room.write().await = None;
        Ok(())
    }

    /// Close the room for everyone. Only its creator may do this.
    pub async fn delete_room(&self) -> Result<(), ClientError> {
        let room_id = self.current_room().await?;
        self.request(ClientRequest::DeleteRoom { room_id }).await?;
        *self.inner.room.write().await = None;
        Ok(())
    }

    /// The relay closed or expired the room
    pub async fn forget_room(&self) {
        *self.inner.room.write().await = None;
    }
}

#[async_trait]
impl SignalSink for RelayClient {
    async fn send_signal(&self, signal: OutboundSignal) -> Result<(), TransportError> {
        let room_id = self
            .current_room()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let encode = |value: Result<serde_json::Value, serde_json::Error>| {
            value.map_err(|e| TransportError::SendFailed(e.to_string()))
        };
        let request = match signal {
            OutboundSignal::Description(desc) => {
                let payload = encode(serde_json::to_value(&desc))?;
                match desc.kind {
                    SdpKind::Offer => ClientRequest::Offer { room_id, payload },
                    SdpKind::Answer => ClientRequest::Answer { room_id, payload },
                }
            }
            OutboundSignal::Candidate(candidate) => ClientRequest::IceCandidate {
                room_id,
                payload: encode(serde_json::to_value(&candidate))?,
            },
            OutboundSignal::ConnectionReady => ClientRequest::ConnectionReady { room_id },
            OutboundSignal::ConnectionEstablished => {
                ClientRequest::ConnectionEstablished { room_id }
            }
        };
        self.send(ClientFrame { id: None, request })
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}
