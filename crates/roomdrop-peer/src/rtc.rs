//! WebRTC transport
//!
//! Implements the transport traits over the webrtc crate. Callbacks from
//! the connection are turned into [`ConnectionEvent`]s on the events queue
//! handed to [`PeerConnectionFactory::create`].

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::transport::{
    ConnectionEvent, ConnectionState, DataChannel, Frame, IceCandidate, PeerConnection,
    PeerConnectionFactory, SdpKind, SessionDescription, SignalingState, TransportError,
};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

pub const DEFAULT_STUN_SERVERS: &[&str] = &["stun:stun.l.google.com:19302"];

fn negotiation_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

type FrameSender = Arc<std::sync::Mutex<Option<mpsc::UnboundedSender<Frame>>>>;

/// Data channel backed by an `RTCDataChannel`
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    incoming: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl RtcDataChannel {
    /// Wrap a channel and report it on `events` once it opens
    fn wrap(dc: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<ConnectionEvent>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            label: dc.label().to_string(),
            dc: dc.clone(),
            incoming: Mutex::new(rx),
        });

        // Dropped on close so that recv() ends
        let frames: FrameSender = Arc::new(std::sync::Mutex::new(Some(tx)));

        let on_message = frames.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let frame = if msg.is_string {
                Frame::Text(String::from_utf8_lossy(&msg.data).to_string())
            } else {
                Frame::Binary(msg.data.clone())
            };
            if let Some(tx) = on_message.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                let _ = tx.send(frame);
            }
            Box::pin(async {})
        }));

        let on_close = frames;
        let label = channel.label.clone();
        dc.on_close(Box::new(move || {
            debug!("Data channel {} closed", label);
            on_close.lock().unwrap_or_else(|e| e.into_inner()).take();
            Box::pin(async {})
        }));

        let weak: Weak<Self> = Arc::downgrade(&channel);
        dc.on_open(Box::new(move || {
            if let Some(channel) = weak.upgrade() {
                info!("Data channel {} open", channel.label);
                let _ = events.send(ConnectionEvent::ChannelOpen(channel));
            }
            Box::pin(async {})
        }));

        channel
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let result = match frame {
            Frame::Text(text) => self.dc.send_text(text).await,
            Frame::Binary(data) => self.dc.send(&data).await,
        };
        result
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Option<Frame> {
        self.incoming.lock().await.recv().await
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}

/// Peer connection backed by an `RTCPeerConnection`
pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(negotiation_err)
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(RtcDataChannel::wrap(dc, self.events.clone()))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(negotiation_err)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(negotiation_err)
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let rollback: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({"type": "rollback", "sdp": ""}))
                .map_err(negotiation_err)?;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(negotiation_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(negotiation_err)
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Closing peer connection failed: {}", e);
        }
    }
}

/// Creates WebRTC peer connections
pub struct RtcFactory {
    ice_servers: Vec<String>,
}

impl RtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

impl Default for RtcFactory {
    fn default() -> Self {
        Self::new(DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect())
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let connection_err = |e: webrtc::Error| TransportError::ConnectionFailed(e.to_string());

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(connection_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(connection_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(connection_err)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(ConnectionEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("Could not encode candidate: {}", e),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let mapped = match state {
                RTCPeerConnectionState::New => Some(ConnectionState::New),
                RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                _ => None,
            };
            if let Some(state) = mapped {
                debug!("Peer connection state: {:?}", state);
                let _ = state_events.send(ConnectionEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        let channel_events = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            debug!("Remote data channel {}", dc.label());
            RtcDataChannel::wrap(dc, channel_events.clone());
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeerConnection { pc, events }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rollback_description_parses() {
        let rollback: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({"type": "rollback", "sdp": ""})).unwrap();
        assert_eq!(rollback.sdp, "");
    }

    #[tokio::test]
    async fn test_factory_creates_connection() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = RtcFactory::new(Vec::new()).create(tx).await.unwrap();
        assert_eq!(pc.signaling_state(), SignalingState::Stable);
        let channel = pc.create_data_channel("fileTransfer").await.unwrap();
        assert_eq!(channel.label(), "fileTransfer");
        assert!(!channel.is_open());
        pc.close().await;
    }
}
