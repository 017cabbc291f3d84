//! Signaling relay for roomdrop
//!
//! Pairs two peers inside a short-lived session and forwards their
//! negotiation messages to each other. The relay never looks inside
//! offers, answers or candidates.
//!
//! - [`Relay`]: transport-agnostic operations (create, join, relay, leave, delete)
//! - [`SessionActor`](session): one task per session owning its participant list
//! - [`SessionStore`]: injectable session index, sharded by default
//! - [`RoomQuota`]: daily room-creation limits for anonymous clients
//! - [`RelayServer`]: axum websocket front end

pub mod connections;
pub mod quota;
pub mod relay;
pub mod server;
pub mod session;
pub mod store;

pub use connections::{ConnectionInfo, ConnectionRegistry};
pub use quota::{DailyRoomQuota, RoomQuota, UnlimitedQuota};
pub use relay::{CreateOutcome, Relay};
pub use server::RelayServer;
pub use session::{JoinOutcome, Session, SessionHandle, Signal, MAX_PARTICIPANTS};
pub use store::{SessionStore, ShardedSessionStore, StoreError};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in unix millis
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
