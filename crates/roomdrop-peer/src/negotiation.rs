//! Negotiation state machine
//!
//! Establishes the data channel over an unreliable signaling path and
//! resolves glare (both sides offering at once) deterministically: the
//! polite peer (responder) rolls back its own offer and answers, the
//! impolite peer (initiator) ignores the colliding offer.
//!
//! All legal transitions live in [`NegotiationState::on`], a pure function.
//! [`Negotiator`] executes the action each transition asks for.

use roomdrop_core::{Role, DATA_CHANNEL_LABEL};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::transport::{
    ConnectionState, DataChannel, IceCandidate, OutboundSignal, PeerConnection, SdpKind,
    SessionDescription, SignalSink, TransportError,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NegotiationError {
    #[error("Channel not ready")]
    ChannelNotReady,
    #[error("Invalid transition: {event:?} in {state}")]
    InvalidTransition {
        state: NegotiationState,
        event: NegotiationEvent,
    },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Where negotiation stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    /// Creating and sending a local offer
    Offering { ignored_remote_offer: bool },
    /// Local offer sent, waiting for the answer
    AwaitingAnswer { ignored_remote_offer: bool },
    /// Remote offer applied, answering
    Answering,
    Stable,
    Disconnected,
    Failed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering { .. } => "offering",
            NegotiationState::AwaitingAnswer { .. } => "awaiting-answer",
            NegotiationState::Answering => "answering",
            NegotiationState::Stable => "stable",
            NegotiationState::Disconnected => "disconnected",
            NegotiationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// Local side wants to (re)negotiate
    StartOffer,
    /// Local offer was applied and sent
    OfferSent,
    RemoteOffer,
    RemoteAnswer,
    /// Local answer was applied and sent
    AnswerSent,
    Connected,
    Disconnected,
    Failed,
    /// Remote peer left the session
    Reset,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    CreateOffer,
    /// Glare on the impolite side: drop the remote offer
    IgnoreOffer,
    /// Glare on the polite side: roll back our offer, then answer theirs
    RollbackAndAnswer,
    Answer,
    ApplyAnswer,
    /// Answer with no outstanding offer
    DropAnswer,
    DiscardChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: NegotiationState,
    pub action: Action,
}

impl Transition {
    fn to(next: NegotiationState, action: Action) -> Self {
        Self { next, action }
    }
}

impl NegotiationState {
    /// Whether a local offer is outstanding
    pub fn is_offering(&self) -> bool {
        matches!(
            self,
            NegotiationState::Offering { .. } | NegotiationState::AwaitingAnswer { .. }
        )
    }

    fn ignoring_offer(&self) -> bool {
        matches!(
            self,
            NegotiationState::Offering {
                ignored_remote_offer: true
            } | NegotiationState::AwaitingAnswer {
                ignored_remote_offer: true
            }
        )
    }

    /// Every legal transition. `polite` is fixed per session by the role.
    pub fn on(self, event: NegotiationEvent, polite: bool) -> Result<Transition, NegotiationError> {
        use NegotiationEvent as E;
        use NegotiationState as S;

        let transition = match (self, event) {
            (S::Offering { .. } | S::AwaitingAnswer { .. } | S::Answering, E::StartOffer) => {
                Transition::to(self, Action::None)
            }
            (_, E::StartOffer) => Transition::to(
                S::Offering {
                    ignored_remote_offer: false,
                },
                Action::CreateOffer,
            ),

            (S::Offering { ignored_remote_offer }, E::OfferSent) => Transition::to(
                S::AwaitingAnswer {
                    ignored_remote_offer,
                },
                Action::None,
            ),

            (S::Offering { .. }, E::RemoteOffer) if !polite => Transition::to(
                S::Offering {
                    ignored_remote_offer: true,
                },
                Action::IgnoreOffer,
            ),
            (S::AwaitingAnswer { .. }, E::RemoteOffer) if !polite => Transition::to(
                S::AwaitingAnswer {
                    ignored_remote_offer: true,
                },
                Action::IgnoreOffer,
            ),
            (S::Offering { .. } | S::AwaitingAnswer { .. }, E::RemoteOffer) => {
                Transition::to(S::Answering, Action::RollbackAndAnswer)
            }
            (_, E::RemoteOffer) => Transition::to(S::Answering, Action::Answer),

            (S::Answering, E::AnswerSent) => Transition::to(S::Stable, Action::None),

            (S::AwaitingAnswer { .. }, E::RemoteAnswer) => {
                Transition::to(S::Stable, Action::ApplyAnswer)
            }
            (_, E::RemoteAnswer) => Transition::to(self, Action::DropAnswer),

            (S::Idle | S::Stable | S::Disconnected | S::Failed, E::Connected) => {
                Transition::to(S::Stable, Action::None)
            }
            (_, E::Connected) => Transition::to(self, Action::None),

            (_, E::Disconnected) => Transition::to(S::Disconnected, Action::DiscardChannel),
            (_, E::Failed) => Transition::to(S::Failed, Action::DiscardChannel),
            (_, E::Reset) => Transition::to(S::Idle, Action::DiscardChannel),

            (state, event) => return Err(NegotiationError::InvalidTransition { state, event }),
        };
        Ok(transition)
    }
}

/// Drives one peer connection through negotiation
///
/// Owned by a single consumer loop; every method takes `&mut self`, so
/// negotiation steps never interleave.
pub struct Negotiator<P: PeerConnection, S: SignalSink> {
    role: Role,
    state: NegotiationState,
    connection: P,
    signals: S,
    channel: Option<Arc<dyn DataChannel>>,
}

impl<P: PeerConnection, S: SignalSink> Negotiator<P, S> {
    pub fn new(role: Role, connection: P, signals: S) -> Self {
        Self {
            role,
            state: NegotiationState::Idle,
            connection,
            signals,
            channel: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn connection(&self) -> &P {
        &self.connection
    }

    /// The open transfer channel
    pub fn data_channel(&self) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        match &self.channel {
            Some(channel) if channel.is_open() => Ok(channel.clone()),
            _ => Err(NegotiationError::ChannelNotReady),
        }
    }

    fn polite(&self) -> bool {
        self.role.is_polite()
    }

    fn step(&mut self, event: NegotiationEvent) -> Result<Action, NegotiationError> {
        let transition = self.state.on(event, self.polite())?;
        if transition.next != self.state {
            debug!("Negotiation {} -> {} on {:?}", self.state, transition.next, event);
        }
        self.state = transition.next;
        Ok(transition.action)
    }

    /// Begin negotiating once the other peer is present. Only the initiator offers.
    pub async fn start(&mut self) -> Result<(), NegotiationError> {
        if self.polite() {
            return Ok(());
        }
        self.start_offer().await
    }

    /// Create, apply and send a local offer
    pub async fn start_offer(&mut self) -> Result<(), NegotiationError> {
        if self.step(NegotiationEvent::StartOffer)? != Action::CreateOffer {
            return Ok(());
        }
        match self.send_offer().await {
            Ok(()) => {
                self.step(NegotiationEvent::OfferSent)?;
                Ok(())
            }
            Err(e) => {
                warn!("Creating offer failed: {}", e);
                self.fail().await;
                Err(e)
            }
        }
    }

    async fn send_offer(&mut self) -> Result<(), NegotiationError> {
        // The channel has to exist before the first offer so it is negotiated
        if self.channel.is_none() {
            self.channel = Some(self.connection.create_data_channel(DATA_CHANNEL_LABEL).await?);
        }
        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(offer.clone()).await?;
        self.signals
            .send_signal(OutboundSignal::Description(offer))
            .await?;
        Ok(())
    }

    /// Apply a remote offer or answer
    pub async fn handle_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        match desc.kind {
            SdpKind::Offer => self.handle_offer(desc).await,
            SdpKind::Answer => self.handle_answer(desc).await,
        }
    }

    async fn handle_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        match self.step(NegotiationEvent::RemoteOffer)? {
            Action::IgnoreOffer => {
                info!("Offer collision, impolite side ignoring remote offer");
                Ok(())
            }
            Action::RollbackAndAnswer => {
                info!("Offer collision, polite side rolling back");
                self.connection.rollback().await?;
                // The rolled-back channel was never negotiated
                if let Some(channel) = self.channel.take() {
                    channel.close().await;
                }
                self.answer(offer).await
            }
            Action::Answer => self.answer(offer).await,
            _ => Ok(()),
        }
    }

    async fn answer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        let result: Result<(), NegotiationError> = async {
            self.connection.set_remote_description(offer).await?;
            let answer = self.connection.create_answer().await?;
            self.connection.set_local_description(answer.clone()).await?;
            self.signals
                .send_signal(OutboundSignal::Description(answer))
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.step(NegotiationEvent::AnswerSent)?;
                Ok(())
            }
            Err(e) => {
                warn!("Answering failed: {}", e);
                self.fail().await;
                Err(e)
            }
        }
    }

    async fn handle_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        match self.step(NegotiationEvent::RemoteAnswer)? {
            Action::ApplyAnswer => {
                if let Err(e) = self.connection.set_remote_description(answer).await {
                    warn!("Applying answer failed: {}", e);
                    self.fail().await;
                    return Err(e.into());
                }
                Ok(())
            }
            _ => {
                warn!("Dropping answer received in {}", self.state);
                Ok(())
            }
        }
    }

    /// Apply a remote candidate. Failures while ignoring an offer are expected.
    pub async fn handle_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        match self.connection.add_ice_candidate(candidate).await {
            Ok(()) => Ok(()),
            Err(e) if self.state.ignoring_offer() => {
                debug!("Ignoring candidate error during collision: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// A channel opened on the connection
    pub fn on_channel_open(&mut self, channel: Arc<dyn DataChannel>) {
        debug!("Data channel {} open", channel.label());
        self.channel = Some(channel);
    }

    pub async fn on_connection_state(
        &mut self,
        state: ConnectionState,
    ) -> Result<(), NegotiationError> {
        let event = match state {
            ConnectionState::Connected => NegotiationEvent::Connected,
            ConnectionState::Disconnected => NegotiationEvent::Disconnected,
            ConnectionState::Failed | ConnectionState::Closed => NegotiationEvent::Failed,
            ConnectionState::New | ConnectionState::Connecting => return Ok(()),
        };
        let action = self.step(event)?;
        if action == Action::DiscardChannel {
            self.discard_channel().await;
        }
        Ok(())
    }

    /// The remote peer left; forget the channel and start over
    pub async fn reset(&mut self) {
        if let Ok(Action::DiscardChannel) = self.step(NegotiationEvent::Reset) {
            self.discard_channel().await;
        }
    }

    async fn fail(&mut self) {
        if let Ok(Action::DiscardChannel) = self.step(NegotiationEvent::Failed) {
            self.discard_channel().await;
        }
    }

    async fn discard_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            debug!("Discarding data channel {}", channel.label());
            channel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockSignalSink, MockSwitchboard};
    use crate::transport::ConnectionEvent;
    use tokio::sync::mpsc;

    type TestNegotiator =
        Negotiator<Arc<crate::mock::MockPeerConnection>, MockSignalSink>;

    struct Side {
        negotiator: TestNegotiator,
        signals: mpsc::UnboundedReceiver<OutboundSignal>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    }

    fn side(board: &MockSwitchboard, role: Role) -> Side {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (sink, signals) = MockSignalSink::new();
        Side {
            negotiator: Negotiator::new(role, board.connect(events_tx), sink),
            signals,
            events,
        }
    }

    fn descriptions(rx: &mut mpsc::UnboundedReceiver<OutboundSignal>) -> Vec<SessionDescription> {
        let mut out = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            if let OutboundSignal::Description(desc) = signal {
                out.push(desc);
            }
        }
        out
    }

    fn open_channels(side: &mut Side) -> usize {
        let mut opened = 0;
        while let Ok(event) = side.events.try_recv() {
            if let ConnectionEvent::ChannelOpen(channel) = event {
                side.negotiator.on_channel_open(channel);
                opened += 1;
            }
        }
        opened
    }

    #[test]
    fn test_transition_table() {
        let idle = NegotiationState::Idle;
        let t = idle.on(NegotiationEvent::StartOffer, false).unwrap();
        assert_eq!(t.action, Action::CreateOffer);

        let offering = NegotiationState::AwaitingAnswer {
            ignored_remote_offer: false,
        };
        assert_eq!(
            offering.on(NegotiationEvent::RemoteOffer, false).unwrap(),
            Transition::to(
                NegotiationState::AwaitingAnswer {
                    ignored_remote_offer: true
                },
                Action::IgnoreOffer
            )
        );
        assert_eq!(
            offering.on(NegotiationEvent::RemoteOffer, true).unwrap(),
            Transition::to(NegotiationState::Answering, Action::RollbackAndAnswer)
        );
        assert_eq!(
            NegotiationState::Stable
                .on(NegotiationEvent::RemoteAnswer, false)
                .unwrap()
                .action,
            Action::DropAnswer
        );
        assert_eq!(
            NegotiationState::Stable
                .on(NegotiationEvent::Failed, true)
                .unwrap(),
            Transition::to(NegotiationState::Failed, Action::DiscardChannel)
        );
        assert!(matches!(
            NegotiationState::Stable.on(NegotiationEvent::OfferSent, false),
            Err(NegotiationError::InvalidTransition { .. })
        ));
        assert!(NegotiationState::Idle
            .on(NegotiationEvent::AnswerSent, true)
            .is_err());
    }

    #[tokio::test]
    async fn test_initiator_offers_on_join_responder_does_not() {
        let board = MockSwitchboard::new();
        let mut initiator = side(&board, Role::Initiator);
        let mut responder = side(&board, Role::Responder);

        responder.negotiator.start().await.unwrap();
        assert_eq!(responder.negotiator.state(), NegotiationState::Idle);
        assert!(descriptions(&mut responder.signals).is_empty());

        initiator.negotiator.start().await.unwrap();
        let offers = descriptions(&mut initiator.signals);
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].kind, SdpKind::Offer);
        assert!(initiator.negotiator.state().is_offering());

        // A second trigger while offering is a no-op
        initiator.negotiator.start_offer().await.unwrap();
        assert!(descriptions(&mut initiator.signals).is_empty());
    }

    #[tokio::test]
    async fn test_plain_negotiation_opens_one_channel() {
        let board = MockSwitchboard::new();
        let mut a = side(&board, Role::Initiator);
        let mut b = side(&board, Role::Responder);

        a.negotiator.start().await.unwrap();
        let offer = descriptions(&mut a.signals).remove(0);
        b.negotiator.handle_description(offer).await.unwrap();
        let answer = descriptions(&mut b.signals).remove(0);
        assert_eq!(answer.kind, SdpKind::Answer);
        a.negotiator.handle_description(answer).await.unwrap();

        assert_eq!(a.negotiator.state(), NegotiationState::Stable);
        assert_eq!(b.negotiator.state(), NegotiationState::Stable);
        assert_eq!(open_channels(&mut a), 1);
        assert_eq!(open_channels(&mut b), 1);
        assert!(a.negotiator.data_channel().is_ok());
        assert!(b.negotiator.data_channel().is_ok());
        assert_eq!(board.established_channels(), 1);
    }

    #[tokio::test]
    async fn test_glare_converges_to_one_channel() {
        let board = MockSwitchboard::new();
        let mut a = side(&board, Role::Initiator);
        let mut b = side(&board, Role::Responder);

        // Both sides offer before seeing the other's offer
        a.negotiator.start_offer().await.unwrap();
        b.negotiator.start_offer().await.unwrap();
        let offer_a = descriptions(&mut a.signals).remove(0);
        let offer_b = descriptions(&mut b.signals).remove(0);

        a.negotiator.handle_description(offer_b).await.unwrap();
        assert_eq!(
            a.negotiator.state(),
            NegotiationState::AwaitingAnswer {
                ignored_remote_offer: true
            }
        );
        assert!(descriptions(&mut a.signals).is_empty());

        b.negotiator.handle_description(offer_a).await.unwrap();
        let from_b = descriptions(&mut b.signals);
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_b[0].kind, SdpKind::Answer);

        a.negotiator
            .handle_description(from_b[0].clone())
            .await
            .unwrap();

        assert_eq!(a.negotiator.state(), NegotiationState::Stable);
        assert_eq!(b.negotiator.state(), NegotiationState::Stable);
        assert_eq!(board.established_channels(), 1);
        assert_eq!(open_channels(&mut a), 1);
        assert_eq!(open_channels(&mut b), 1);

        let ours = a.negotiator.data_channel().unwrap();
        let theirs = b.negotiator.data_channel().unwrap();
        ours.send(crate::transport::Frame::Text("hello".to_string()))
            .await
            .unwrap();
        assert_eq!(
            theirs.recv().await,
            Some(crate::transport::Frame::Text("hello".to_string()))
        );
    }

    #[tokio::test]
    async fn test_candidate_errors_swallowed_only_while_ignoring() {
        let board = MockSwitchboard::new();
        let mut a = side(&board, Role::Initiator);
        let candidate = IceCandidate {
            candidate: "candidate:x".to_string(),
            sdp_mid: None,
            sdp_mline_index: None,
        };

        // No remote description yet and no collision: surfaced
        assert!(a.negotiator.handle_candidate(candidate.clone()).await.is_err());

        a.negotiator.start_offer().await.unwrap();
        a.negotiator
            .handle_description(SessionDescription::offer("mock-offer uid=99 seq=1"))
            .await
            .unwrap();
        assert!(a.negotiator.handle_candidate(candidate).await.is_ok());
    }

    #[tokio::test]
    async fn test_failure_discards_channel() {
        let board = MockSwitchboard::new();
        let mut a = side(&board, Role::Initiator);
        let mut b = side(&board, Role::Responder);

        a.negotiator.start().await.unwrap();
        let offer = descriptions(&mut a.signals).remove(0);
        b.negotiator.handle_description(offer).await.unwrap();
        let answer = descriptions(&mut b.signals).remove(0);
        a.negotiator.handle_description(answer).await.unwrap();
        open_channels(&mut a);

        a.negotiator
            .on_connection_state(ConnectionState::Failed)
            .await
            .unwrap();
        assert_eq!(a.negotiator.state(), NegotiationState::Failed);
        assert_eq!(
            a.negotiator.data_channel().err(),
            Some(NegotiationError::ChannelNotReady)
        );

        // A later negotiation creates a fresh channel
        a.negotiator.start_offer().await.unwrap();
        assert!(a.negotiator.state().is_offering());
    }

    #[tokio::test]
    async fn test_late_answer_dropped() {
        let board = MockSwitchboard::new();
        let mut b = side(&board, Role::Responder);
        b.negotiator
            .handle_description(SessionDescription::answer("mock-answer uid=1 to=2"))
            .await
            .unwrap();
        assert_eq!(b.negotiator.state(), NegotiationState::Idle);
    }
}
