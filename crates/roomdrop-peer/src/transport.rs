//! Transport abstraction
//!
//! Defines traits for the peer connection, its data channel and the
//! signaling path, so negotiation and transfer logic runs the same over
//! real WebRTC and over in-memory mocks.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from transport operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Channel closed")]
    Closed,
}

/// One message on the data channel. Control frames are text, payload is binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Offer or answer, relayed opaquely
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate, relayed opaquely
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Signaling state of the underlying connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Overall connection state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications from a peer connection
#[derive(Clone)]
pub enum ConnectionEvent {
    /// A data channel is open, either ours or one the remote created
    ChannelOpen(Arc<dyn DataChannel>),
    /// A local candidate to send to the remote peer
    IceCandidate(IceCandidate),
    StateChanged(ConnectionState),
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::ChannelOpen(ch) => write!(f, "ChannelOpen({})", ch.label()),
            ConnectionEvent::IceCandidate(c) => write!(f, "IceCandidate({})", c.candidate),
            ConnectionEvent::StateChanged(s) => write!(f, "StateChanged({:?})", s),
        }
    }
}

/// Ordered, reliable data channel to the peer
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Next frame from the peer, `None` once closed
    async fn recv(&self) -> Option<Frame>;

    /// Bytes queued locally and not yet handed to the network
    async fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// One peer connection, driven by the negotiator
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create the transfer channel. Must happen before the first offer.
    async fn create_data_channel(&self, label: &str)
        -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Abandon a local offer and return to stable
    async fn rollback(&self) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    fn signaling_state(&self) -> SignalingState;

    async fn close(&self);
}

/// Creates peer connections that report to `events`
///
/// The events queue is unbounded: connections emit from inside negotiation
/// calls, and the consumer of the queue is the same loop making those calls.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, TransportError>;
}

/// Outbound signaling traffic
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
    Description(SessionDescription),
    Candidate(IceCandidate),
    ConnectionReady,
    ConnectionEstablished,
}

/// Path to the remote peer through the relay
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send_signal(&self, signal: OutboundSignal) -> Result<(), TransportError>;
}

// Blanket implementations for Arc<T> so Arc-wrapped transports satisfy the traits

#[async_trait]
impl<T: DataChannel + ?Sized> DataChannel for Arc<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        (**self).send(frame).await
    }

    async fn recv(&self) -> Option<Frame> {
        (**self).recv().await
    }

    async fn buffered_amount(&self) -> usize {
        (**self).buffered_amount().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn close(&self) {
        (**self).close().await
    }
}

#[async_trait]
impl<T: PeerConnection + ?Sized> PeerConnection for Arc<T> {
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        (**self).create_data_channel(label).await
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        (**self).create_offer().await
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        (**self).create_answer().await
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        (**self).set_local_description(desc).await
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        (**self).set_remote_description(desc).await
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        (**self).rollback().await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        (**self).add_ice_candidate(candidate).await
    }

    fn signaling_state(&self) -> SignalingState {
        (**self).signaling_state()
    }

    async fn close(&self) {
        (**self).close().await
    }
}

#[async_trait]
impl<T: SignalSink + ?Sized> SignalSink for Arc<T> {
    async fn send_signal(&self, signal: OutboundSignal) -> Result<(), TransportError> {
        (**self).send_signal(signal).await
    }
}
