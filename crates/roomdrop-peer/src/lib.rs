//! Peer side of roomdrop
//!
//! Connects to the signaling relay, negotiates a direct data channel with
//! the other peer and moves files over it.
//!
//! # Overview
//!
//! - **Negotiation**: perfect-negotiation state machine with deterministic glare resolution
//! - **Transfer engine**: chunked, throttled, backpressured file streaming with pause/resume/cancel
//! - **Orchestrator**: sequential upload queue with stable transfer ids
//! - **Endpoint**: single consumer loop tying relay events, connection events and frames together
//!
//! # Example
//!
//! ```rust,no_run
//! use roomdrop_config::TransferConfig;
//! use roomdrop_core::Tier;
//! use roomdrop_peer::mock::MockSwitchboard;
//! use roomdrop_peer::{OutgoingFile, PeerEndpoint, RelayClient, TransferOrchestrator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (client, relay_events) = RelayClient::connect("ws://127.0.0.1:3000/ws").await?;
//!     let (room, _expires_at) = client.create_room().await?;
//!     println!("Share this code: {}", room);
//!
//!     let orchestrator = TransferOrchestrator::new(Tier::Anonymous, TransferConfig::default());
//!     let (endpoint, handle, _events) = PeerEndpoint::new(
//!         Arc::new(MockSwitchboard::new()),
//!         Arc::new(client),
//!         orchestrator.clone(),
//!     );
//!     handle.forward_relay_events(relay_events);
//!     handle.attach(roomdrop_core::Role::Initiator, false);
//!     tokio::spawn(endpoint.run());
//!
//!     // Once the channel is open:
//!     orchestrator
//!         .enqueue(vec![OutgoingFile::from_path("photo.png").await?])
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod budget;
pub mod endpoint;
pub mod mock;
pub mod negotiation;
pub mod orchestrator;
pub mod receiver;
pub mod relay_client;
#[cfg(feature = "webrtc")]
pub mod rtc;
pub mod sender;
pub mod source;
pub mod transport;

pub use budget::{SpeedMeter, ThroughputBudget};
pub use endpoint::{EndpointEvent, PeerEndpoint, PeerHandle, PeerInput, SignalBuffer};
pub use negotiation::{
    Action, NegotiationError, NegotiationEvent, NegotiationState, Negotiator, Transition,
};
pub use orchestrator::{OrchestratorEvent, TransferOrchestrator, TransferRecord, TransferState};
pub use receiver::{IncomingTransfer, ReceiverEvent, TransferReceiver};
pub use relay_client::{ClientError, JoinedRoom, RelayClient};
#[cfg(feature = "webrtc")]
pub use rtc::{RtcDataChannel, RtcFactory, RtcPeerConnection};
pub use sender::{
    ControlHandle, SendOutcome, SendProgress, TransferControl, TransferError, TransferSender,
};
pub use source::{mime_from_name, FileSource, MemorySource, OutgoingFile, PathSource};
pub use transport::{
    ConnectionEvent, ConnectionState, DataChannel, Frame, IceCandidate, OutboundSignal,
    PeerConnection, PeerConnectionFactory, SdpKind, SessionDescription, SignalSink,
    SignalingState, TransportError,
};
