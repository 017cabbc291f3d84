//! Shared vocabulary for roomdrop
//!
//! Both the signaling relay and the peers depend on this crate:
//! - **Identifiers**: session codes, transfer ids and relay connection ids
//! - **Tiers**: account tiers and the resolver seam for account storage
//! - **Relay protocol**: JSON frames exchanged with the signaling relay
//! - **Control protocol**: JSON control frames sent over the data channel

pub mod control;
pub mod error;
pub mod ids;
pub mod tier;
pub mod wire;

pub use control::{ControlMessage, FileInfo, FileRef, FileSummary, ProtocolError};
pub use error::RelayError;
pub use ids::{ConnectionId, Role, SessionId, TransferId};
pub use tier::{StaticTierResolver, Tier, TierResolver};
pub use wire::{AckResult, ClientFrame, ClientRequest, RelayEvent, ServerFrame};

/// Label of the data channel carrying file transfers
pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";
