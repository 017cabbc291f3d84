//! Peer endpoint loop
//!
//! One consumer task per peer owns the negotiator, the receiver and the
//! link to the orchestrator. Relay events, connection events and channel
//! frames all arrive on a single inbound queue, so nothing here needs a
//! lock and negotiation steps never interleave.

use roomdrop_core::{ControlMessage, RelayEvent, Role, TransferId};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::negotiation::Negotiator;
use crate::orchestrator::TransferOrchestrator;
use crate::receiver::{ReceiverEvent, TransferReceiver};
use crate::transport::{
    ConnectionEvent, ConnectionState, DataChannel, Frame, IceCandidate, OutboundSignal,
    PeerConnection, PeerConnectionFactory, SessionDescription, SignalSink,
};

/// Everything the endpoint loop reacts to
///
/// `Connection`, `Frame` and `ChannelClosed` are produced internally and
/// carry the epoch of the connection or channel they came from; stale
/// epochs are ignored.
#[derive(Debug)]
pub enum PeerInput {
    /// We are in a room. `peer_present` when the other peer is already there.
    Attach { role: Role, peer_present: bool },
    Relay(RelayEvent),
    Connection { epoch: u64, event: ConnectionEvent },
    Frame { epoch: u64, frame: Frame },
    ChannelClosed { epoch: u64 },
    /// Abort an incoming transfer and tell the sender
    CancelIncoming(TransferId),
    Shutdown,
}

/// What the endpoint reports to the application
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    PeerJoined,
    PeerLeft,
    /// The data channel is open and transfers may start
    ChannelOpen,
    /// The data channel or connection went away
    Disconnected,
    /// The remote peer's connection came up
    PeerReady,
    /// The remote peer's data channel opened
    PeerConnected,
    RoomClosed,
    RoomExpired,
    Received(ReceiverEvent),
    Error(String),
}

/// Signals that arrived before the negotiator existed, in arrival order
#[derive(Debug, Default)]
pub struct SignalBuffer {
    queued: VecDeque<RelayEvent>,
}

impl SignalBuffer {
    /// Keep negotiation traffic for later. Returns the event back if it is
    /// not negotiation traffic.
    pub fn hold(&mut self, event: RelayEvent) -> Option<RelayEvent> {
        match event {
            RelayEvent::Offer { .. }
            | RelayEvent::Answer { .. }
            | RelayEvent::IceCandidate { .. }
            | RelayEvent::UserJoined { .. } => {
                self.queued.push_back(event);
                None
            }
            other => Some(other),
        }
    }

    pub fn drain(&mut self) -> Vec<RelayEvent> {
        self.queued.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

/// Cloneable sender into a [`PeerEndpoint`]
#[derive(Clone)]
pub struct PeerHandle {
    inputs: mpsc::UnboundedSender<PeerInput>,
}

impl PeerHandle {
    pub fn send(&self, input: PeerInput) -> bool {
        self.inputs.send(input).is_ok()
    }

    pub fn attach(&self, role: Role, peer_present: bool) -> bool {
        self.send(PeerInput::Attach { role, peer_present })
    }

    pub fn relay_event(&self, event: RelayEvent) -> bool {
        self.send(PeerInput::Relay(event))
    }

    pub fn cancel_incoming(&self, id: TransferId) -> bool {
        self.send(PeerInput::CancelIncoming(id))
    }

    pub fn shutdown(&self) -> bool {
        self.send(PeerInput::Shutdown)
    }

    /// Feed relay events into the endpoint until either side goes away
    pub fn forward_relay_events(&self, mut events: mpsc::UnboundedReceiver<RelayEvent>) {
        let handle = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !handle.relay_event(event) {
                    break;
                }
            }
        });
    }
}

type ActiveNegotiator = Negotiator<Arc<dyn PeerConnection>, Arc<dyn SignalSink>>;

pub struct PeerEndpoint {
    factory: Arc<dyn PeerConnectionFactory>,
    signals: Arc<dyn SignalSink>,
    orchestrator: TransferOrchestrator,
    receiver: TransferReceiver,
    negotiator: Option<ActiveNegotiator>,
    buffer: SignalBuffer,
    role: Option<Role>,
    /// Bumped for every new peer connection
    connection_epoch: u64,
    /// Bumped for every opened data channel
    channel_epoch: u64,
    channel: Option<Arc<dyn DataChannel>>,
    inputs: mpsc::UnboundedReceiver<PeerInput>,
    input_tx: mpsc::UnboundedSender<PeerInput>,
    events: mpsc::UnboundedSender<EndpointEvent>,
}

impl PeerEndpoint {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        signals: Arc<dyn SignalSink>,
        orchestrator: TransferOrchestrator,
    ) -> (Self, PeerHandle, mpsc::UnboundedReceiver<EndpointEvent>) {
        let (input_tx, inputs) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let endpoint = Self {
            factory,
            signals,
            orchestrator,
            receiver: TransferReceiver::new(),
            negotiator: None,
            buffer: SignalBuffer::default(),
            role: None,
            connection_epoch: 0,
            channel_epoch: 0,
            channel: None,
            inputs,
            input_tx: input_tx.clone(),
            events,
        };
        (endpoint, PeerHandle { inputs: input_tx }, events_rx)
    }

    pub fn orchestrator(&self) -> &TransferOrchestrator {
        &self.orchestrator
    }

    /// Run until [`PeerInput::Shutdown`]
    pub async fn run(mut self) {
        while let Some(input) = self.inputs.recv().await {
            match input {
                PeerInput::Shutdown => break,
                PeerInput::Attach { role, peer_present } => self.attach(role, peer_present).await,
                PeerInput::Relay(event) => self.handle_relay(event).await,
                PeerInput::Connection { epoch, event } => {
                    if epoch == self.connection_epoch {
                        self.handle_connection(event).await;
                    }
                }
                PeerInput::Frame { epoch, frame } => {
                    if epoch == self.channel_epoch {
                        self.handle_frame(frame).await;
                    }
                }
                PeerInput::ChannelClosed { epoch } => {
                    if epoch == self.channel_epoch && self.channel.is_some() {
                        debug!("Data channel closed");
                        self.lose_channel().await;
                    }
                }
                PeerInput::CancelIncoming(id) => self.cancel_incoming(id).await,
            }
        }
        debug!("Peer endpoint shutting down");
        self.teardown().await;
    }

    fn emit(&self, event: EndpointEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, context: &str, error: impl std::fmt::Display) {
        warn!("{}: {}", context, error);
        self.emit(EndpointEvent::Error(format!("{}: {}", context, error)));
    }

    async fn attach(&mut self, role: Role, peer_present: bool) {
        info!("Attached as {:?}", role);
        self.role = Some(role);
        if let Err(e) = self.connect(role).await {
            self.report("Creating peer connection failed", e);
            return;
        }
        for event in self.buffer.drain() {
            self.handle_relay(event).await;
        }
        if peer_present {
            self.start_negotiation().await;
        }
    }

    /// New peer connection and negotiator for `role`
    async fn connect(&mut self, role: Role) -> Result<(), crate::transport::TransportError> {
        self.connection_epoch += 1;
        let epoch = self.connection_epoch;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = self.factory.create(tx).await?;

        let inputs = self.input_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if inputs.send(PeerInput::Connection { epoch, event }).is_err() {
                    break;
                }
            }
        });

        self.negotiator = Some(Negotiator::new(role, connection, self.signals.clone()));
        Ok(())
    }

    async fn start_negotiation(&mut self) {
        if let Some(negotiator) = self.negotiator.as_mut() {
            if let Err(e) = negotiator.start().await {
                self.report("Starting negotiation failed", e);
            }
        }
    }

    async fn handle_relay(&mut self, event: RelayEvent) {
        let event = if self.negotiator.is_none() {
            match self.buffer.hold(event) {
                Some(event) => event,
                None => return,
            }
        } else {
            event
        };

        match event {
            RelayEvent::UserJoined { user_id } => {
                debug!("{} joined", user_id);
                self.emit(EndpointEvent::PeerJoined);
                self.start_negotiation().await;
            }
            RelayEvent::UserLeft { user_id } => {
                debug!("{} left", user_id);
                self.emit(EndpointEvent::PeerLeft);
                self.lose_channel().await;
                // Start over with a fresh connection for the next peer
                self.close_connection().await;
                if let Some(role) = self.role {
                    if let Err(e) = self.connect(role).await {
                        self.report("Creating peer connection failed", e);
                    }
                }
            }
            RelayEvent::Offer { payload, .. } | RelayEvent::Answer { payload, .. } => {
                let desc: SessionDescription = match serde_json::from_value(payload) {
                    Ok(desc) => desc,
                    Err(e) => return self.report("Invalid session description", e),
                };
                if let Some(negotiator) = self.negotiator.as_mut() {
                    if let Err(e) = negotiator.handle_description(desc).await {
                        self.report("Negotiation failed", e);
                    }
                }
            }
            RelayEvent::IceCandidate { payload, .. } => {
                let candidate: IceCandidate = match serde_json::from_value(payload) {
                    Ok(candidate) => candidate,
                    Err(e) => return self.report("Invalid candidate", e),
                };
                if let Some(negotiator) = self.negotiator.as_mut() {
                    if let Err(e) = negotiator.handle_candidate(candidate).await {
                        self.report("Applying candidate failed", e);
                    }
                }
            }
            RelayEvent::PeerConnectionReady { .. } => self.emit(EndpointEvent::PeerReady),
            RelayEvent::PeerConnected { .. } => self.emit(EndpointEvent::PeerConnected),
            RelayEvent::RoomClosed { room_id } => {
                info!("Room {} closed", room_id);
                self.teardown().await;
                self.emit(EndpointEvent::RoomClosed);
            }
            RelayEvent::RoomExpired { room_id } => {
                info!("Room {} expired", room_id);
                self.teardown().await;
                self.emit(EndpointEvent::RoomExpired);
            }
        }
    }

    async fn handle_connection(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::ChannelOpen(channel) => self.open_channel(channel).await,
            ConnectionEvent::IceCandidate(candidate) => {
                if let Err(e) = self
                    .signals
                    .send_signal(OutboundSignal::Candidate(candidate))
                    .await
                {
                    self.report("Sending candidate failed", e);
                }
            }
            ConnectionEvent::StateChanged(state) => {
                if let Some(negotiator) = self.negotiator.as_mut() {
                    if let Err(e) = negotiator.on_connection_state(state).await {
                        self.report("Connection state", e);
                    }
                }
                match state {
                    ConnectionState::Connected => {
                        let _ = self
                            .signals
                            .send_signal(OutboundSignal::ConnectionReady)
                            .await;
                    }
                    ConnectionState::Disconnected
                    | ConnectionState::Failed
                    | ConnectionState::Closed => self.lose_channel().await,
                    ConnectionState::New | ConnectionState::Connecting => {}
                }
            }
        }
    }

    async fn open_channel(&mut self, channel: Arc<dyn DataChannel>) {
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.on_channel_open(channel.clone());
        }
        self.channel_epoch += 1;
        let epoch = self.channel_epoch;
        self.channel = Some(channel.clone());

        let inputs = self.input_tx.clone();
        let pump = channel.clone();
        tokio::spawn(async move {
            while let Some(frame) = pump.recv().await {
                if inputs.send(PeerInput::Frame { epoch, frame }).is_err() {
                    return;
                }
            }
            let _ = inputs.send(PeerInput::ChannelClosed { epoch });
        });

        self.orchestrator.set_channel(Some(channel)).await;
        if let Err(e) = self
            .signals
            .send_signal(OutboundSignal::ConnectionEstablished)
            .await
        {
            debug!("Could not announce channel: {}", e);
        }
        info!("Data channel open");
        self.emit(EndpointEvent::ChannelOpen);
    }

    async fn handle_frame(&mut self, frame: Frame) {
        let result = match frame {
            Frame::Text(text) => match ControlMessage::parse(&text) {
                Ok(msg) => {
                    // Control frames about our own uploads belong to the orchestrator
                    if self.orchestrator.on_peer_control(&msg).await {
                        return;
                    }
                    self.receiver.handle_control(msg)
                }
                Err(e) => Err(e.into()),
            },
            binary => self.receiver.handle_frame(binary),
        };
        match result {
            Ok(Some(event)) => self.emit(EndpointEvent::Received(event)),
            Ok(None) => {}
            Err(e) => self.report("Bad frame from peer", e),
        }
    }

    async fn cancel_incoming(&mut self, id: TransferId) {
        if !self.receiver.discard(&id) {
            return;
        }
        if let Some(channel) = &self.channel {
            if let Ok(text) = ControlMessage::cancelled(&id).encode() {
                let _ = channel.send(Frame::Text(text)).await;
            }
        }
        self.emit(EndpointEvent::Received(ReceiverEvent::Cancelled(id)));
    }

    /// Drop the data channel silently: partial downloads are discarded and
    /// the upload in flight fails
    async fn lose_channel(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        self.channel_epoch += 1;
        channel.close().await;
        self.receiver.reset();
        self.orchestrator.set_channel(None).await;
        self.emit(EndpointEvent::Disconnected);
    }

    async fn close_connection(&mut self) {
        if let Some(mut negotiator) = self.negotiator.take() {
            negotiator.reset().await;
            negotiator.connection().close().await;
        }
        // Late events from the old connection are ignored
        self.connection_epoch += 1;
    }

    async fn teardown(&mut self) {
        self.lose_channel().await;
        self.close_connection().await;
        self.buffer.drain();
        self.role = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPeerConnection, MockSignalSink, MockSwitchboard};
    use crate::orchestrator::TransferOrchestrator;
    use crate::transport::SdpKind;
    use async_trait::async_trait;
    use roomdrop_config::TransferConfig;
    use roomdrop_core::{ConnectionId, Tier};
    use serde_json::json;
    use std::time::Duration;

    /// Switchboard factory that keeps the connections it hands out
    #[derive(Default)]
    struct RecordingFactory {
        switchboard: MockSwitchboard,
        created: std::sync::Mutex<Vec<Arc<MockPeerConnection>>>,
    }

    #[async_trait]
    impl PeerConnectionFactory for RecordingFactory {
        async fn create(
            &self,
            events: mpsc::UnboundedSender<ConnectionEvent>,
        ) -> Result<Arc<dyn PeerConnection>, crate::transport::TransportError> {
            let connection = self.switchboard.connect(events);
            self.created.lock().unwrap().push(connection.clone());
            Ok(connection)
        }
    }

    #[test]
    fn test_signal_buffer_keeps_order() {
        let mut buffer = SignalBuffer::default();
        let offer = RelayEvent::Offer {
            from: ConnectionId(2),
            payload: json!({"type": "offer", "sdp": "x"}),
        };
        let candidate = RelayEvent::IceCandidate {
            from: ConnectionId(2),
            payload: json!({"candidate": "c"}),
        };
        assert!(buffer.hold(offer.clone()).is_none());
        assert!(buffer.hold(candidate.clone()).is_none());

        let ready = RelayEvent::PeerConnectionReady {
            from: ConnectionId(2),
        };
        assert_eq!(buffer.hold(ready.clone()), Some(ready));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.drain(), vec![offer, candidate]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_signals_before_attach_replay_in_order() {
        let factory = Arc::new(RecordingFactory::default());
        let (sink, mut signals) = MockSignalSink::new();
        let orchestrator = TransferOrchestrator::new(Tier::Anonymous, TransferConfig::default());
        let (endpoint, handle, _events) =
            PeerEndpoint::new(factory.clone(), Arc::new(sink), orchestrator);

        let offer = SessionDescription::offer("mock-offer uid=99 seq=1");
        let candidate = IceCandidate {
            candidate: "candidate:remote 1 udp 1 127.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        // Both arrive before the endpoint knows its role
        handle.relay_event(RelayEvent::Offer {
            from: ConnectionId(99),
            payload: serde_json::to_value(&offer).unwrap(),
        });
        handle.relay_event(RelayEvent::IceCandidate {
            from: ConnectionId(99),
            payload: serde_json::to_value(&candidate).unwrap(),
        });
        handle.attach(Role::Responder, true);
        tokio::spawn(endpoint.run());

        let mut descriptions = Vec::new();
        while let Ok(Some(signal)) =
            tokio::time::timeout(Duration::from_millis(200), signals.recv()).await
        {
            if let OutboundSignal::Description(desc) = signal {
                descriptions.push(desc);
            }
        }
        assert_eq!(descriptions.len(), 1);
        assert_eq!(descriptions[0].kind, SdpKind::Answer);
        assert!(descriptions[0].sdp.contains("to=99"));

        // Applied after the offer, otherwise the connection would have refused it
        let created = factory.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].remote_candidates(), vec![candidate]);
        handle.shutdown();
    }
}
