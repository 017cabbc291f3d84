//! Mock implementations for testing and simulation
//!
//! In-memory data channels, peer connections and signal sinks. A
//! [`MockSwitchboard`] plays the role of the network: connections created
//! from the same switchboard can reach each other, and it counts how many
//! channels were actually established.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use crate::transport::{
    ConnectionEvent, ConnectionState, DataChannel, Frame, IceCandidate, OutboundSignal,
    PeerConnection, PeerConnectionFactory, SdpKind, SessionDescription, SignalSink,
    SignalingState, TransportError,
};

// ============================================================================
// Mock Data Channel
// ============================================================================

/// One end of an in-memory data channel
///
/// Bytes count as buffered from `send` until the other end reads them,
/// which gives `buffered_amount` the same meaning as on a real channel.
pub struct MockDataChannel {
    label: String,
    tx: mpsc::UnboundedSender<Frame>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    open: Arc<AtomicBool>,
    closed: Arc<watch::Sender<bool>>,
    outgoing: Arc<AtomicUsize>,
    incoming: Arc<AtomicUsize>,
}

impl MockDataChannel {
    /// Create a connected pair of channels, not yet open
    pub fn pair(label: &str) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let a_to_b = Arc::new(AtomicUsize::new(0));
        let b_to_a = Arc::new(AtomicUsize::new(0));

        let chan_a = Self {
            label: label.to_string(),
            tx: tx_b, // A sends to B's receiver
            rx: tokio::sync::Mutex::new(rx_a),
            open: open.clone(),
            closed: closed.clone(),
            outgoing: a_to_b.clone(),
            incoming: b_to_a.clone(),
        };
        let chan_b = Self {
            label: label.to_string(),
            tx: tx_a, // B sends to A's receiver
            rx: tokio::sync::Mutex::new(rx_b),
            open,
            closed,
            outgoing: b_to_a,
            incoming: a_to_b,
        };
        (chan_a, chan_b)
    }

    /// Create an already open pair
    pub fn open_pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let (a, b) = Self::pair(label);
        a.set_open(true);
        (Arc::new(a), Arc::new(b))
    }

    /// Open or close both ends
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
        if !open {
            self.closed.send_replace(true);
        }
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let len = frame.len();
        self.outgoing.fetch_add(len, Ordering::SeqCst);
        self.tx.send(frame).map_err(|_| {
            self.outgoing.fetch_sub(len, Ordering::SeqCst);
            TransportError::Closed
        })
    }

    async fn recv(&self) -> Option<Frame> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return None;
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let frame = frame?;
                self.incoming.fetch_sub(frame.len(), Ordering::SeqCst);
                Some(frame)
            }
            _ = closed.wait_for(|c| *c) => None,
        }
    }

    async fn buffered_amount(&self) -> usize {
        self.outgoing.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.set_open(false);
    }
}

// ============================================================================
// Mock Peer Connection
// ============================================================================

struct MockPcState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    pending_channel: Option<(Arc<MockDataChannel>, Arc<MockDataChannel>)>,
    offers: u32,
    remote_candidates: Vec<IceCandidate>,
}

/// In-memory peer connection following the offer/answer state rules
pub struct MockPeerConnection {
    uid: u64,
    switchboard: Arc<SwitchboardInner>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Mutex<MockPcState>,
}

impl MockPeerConnection {
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Candidates applied so far
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.lock().remote_candidates.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockPcState> {
        // A poisoned lock only means a test panicked elsewhere
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:mock {} 1 udp 1 127.0.0.1 9 typ host", self.uid),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }
}

fn sdp_field(sdp: &str, key: &str) -> Option<u64> {
    sdp.split_whitespace()
        .find_map(|part| part.strip_prefix(key))
        .and_then(|v| v.parse().ok())
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let (local, remote) = MockDataChannel::pair(label);
        let local = Arc::new(local);
        self.lock().pending_channel = Some((local.clone(), Arc::new(remote)));
        Ok(local)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.lock();
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "mock-offer uid={} seq={}",
            self.uid, state.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let state = self.lock();
        let offerer = state
            .remote
            .as_ref()
            .filter(|d| d.kind == SdpKind::Offer)
            .and_then(|d| sdp_field(&d.sdp, "uid="))
            .ok_or_else(|| TransportError::Negotiation("no remote offer".to_string()))?;
        Ok(SessionDescription::answer(format!(
            "mock-answer uid={} to={}",
            self.uid, offerer
        )))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.lock();
            match (desc.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::HaveLocalOffer;
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                }
                (kind, current) => {
                    return Err(TransportError::Negotiation(format!(
                        "cannot set local {:?} in {:?}",
                        kind, current
                    )));
                }
            }
            state.local = Some(desc);
        }
        self.emit(ConnectionEvent::IceCandidate(self.local_candidate()));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let linked = {
            let mut state = self.lock();
            match (desc.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                    state.remote = Some(desc);
                    return Ok(());
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    let answerer = sdp_field(&desc.sdp, "uid=");
                    state.remote = Some(desc);
                    (answerer, state.pending_channel.take())
                }
                (kind, current) => {
                    return Err(TransportError::Negotiation(format!(
                        "cannot set remote {:?} in {:?}",
                        kind, current
                    )));
                }
            }
        };

        if let (Some(answerer), Some((local, remote))) = linked {
            local.set_open(true);
            self.switchboard.established.fetch_add(1, Ordering::SeqCst);
            self.switchboard
                .deliver(answerer, ConnectionEvent::ChannelOpen(remote));
            self.switchboard.deliver(
                answerer,
                ConnectionEvent::StateChanged(ConnectionState::Connected),
            );
            self.emit(ConnectionEvent::ChannelOpen(local));
            self.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.signaling == SignalingState::HaveLocalOffer {
            state.signaling = SignalingState::Stable;
            state.local = None;
            if let Some((local, _)) = state.pending_channel.take() {
                local.set_open(false);
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.remote.is_none() {
            return Err(TransportError::Negotiation(
                "no remote description".to_string(),
            ));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.lock().signaling
    }

    async fn close(&self) {
        self.lock().signaling = SignalingState::Closed;
        self.emit(ConnectionEvent::StateChanged(ConnectionState::Closed));
    }
}

// ============================================================================
// Switchboard
// ============================================================================

#[derive(Default)]
struct SwitchboardInner {
    next_uid: AtomicU64,
    peers: Mutex<HashMap<u64, mpsc::UnboundedSender<ConnectionEvent>>>,
    established: AtomicUsize,
}

impl SwitchboardInner {
    fn deliver(&self, uid: u64, event: ConnectionEvent) {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = peers.get(&uid) {
            let _ = tx.send(event);
        }
    }
}

/// In-memory network linking mock peer connections
#[derive(Clone, Default)]
pub struct MockSwitchboard {
    inner: Arc<SwitchboardInner>,
}

impl MockSwitchboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of data channels opened between two connections
    pub fn established_channels(&self) -> usize {
        self.inner.established.load(Ordering::SeqCst)
    }

    /// Report a connection state to every connection, e.g. a network drop
    pub fn broadcast_state(&self, state: ConnectionState) {
        let peers = self.inner.peers.lock().unwrap_or_else(|e| e.into_inner());
        for tx in peers.values() {
            let _ = tx.send(ConnectionEvent::StateChanged(state));
        }
    }

    /// Create a connection directly, without going through the trait object
    pub fn connect(&self, events: mpsc::UnboundedSender<ConnectionEvent>) -> Arc<MockPeerConnection> {
        let uid = self.inner.next_uid.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uid, events.clone());
        Arc::new(MockPeerConnection {
            uid,
            switchboard: self.inner.clone(),
            events,
            state: Mutex::new(MockPcState {
                signaling: SignalingState::Stable,
                local: None,
                remote: None,
                pending_channel: None,
                offers: 0,
                remote_candidates: Vec::new(),
            }),
        })
    }
}

#[async_trait]
impl PeerConnectionFactory for MockSwitchboard {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        Ok(self.connect(events))
    }
}

// ============================================================================
// Mock Signal Sink
// ============================================================================

/// Signal sink that hands every outbound signal to a channel
pub struct MockSignalSink {
    tx: mpsc::UnboundedSender<OutboundSignal>,
}

impl MockSignalSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SignalSink for MockSignalSink {
    async fn send_signal(&self, signal: OutboundSignal) -> Result<(), TransportError> {
        self.tx
            .send(signal)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}
