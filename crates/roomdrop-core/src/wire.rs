//! Relay wire protocol
//!
//! JSON text frames over a websocket.
//! Client to relay: `{"id": 7, "event": "join-room", "data": {"roomId": "AB12CD34"}}`
//! Relay to client: `{"ack": 7, "result": {...}}` or `{"event": "user-joined", "data": {...}}`
//!
//! Negotiation payloads (`offer`, `answer`, `ice-candidate`) are opaque JSON
//! values; the relay forwards them without looking inside.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;
use crate::ids::{ConnectionId, Role, SessionId};

/// A request from a client, optionally expecting an acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub request: ClientRequest,
}

/// Operations a client can ask the relay for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientRequest {
    CreateRoom,
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: SessionId,
    },
    LeaveRoom {
        #[serde(rename = "roomId")]
        room_id: SessionId,
    },
    DeleteRoom {
        #[serde(rename = "roomId")]
        room_id: SessionId,
    },
    Offer {
        #[serde(rename = "roomId")]
        room_id: SessionId,
        payload: Value,
    },
    Answer {
        #[serde(rename = "roomId")]
        room_id: SessionId,
        payload: Value,
    },
    IceCandidate {
        #[serde(rename = "roomId")]
        room_id: SessionId,
        payload: Value,
    },
    ConnectionReady {
        #[serde(rename = "roomId")]
        room_id: SessionId,
    },
    ConnectionEstablished {
        #[serde(rename = "roomId")]
        room_id: SessionId,
    },
}

/// Events pushed by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayEvent {
    UserJoined {
        #[serde(rename = "userId")]
        user_id: ConnectionId,
    },
    UserLeft {
        #[serde(rename = "userId")]
        user_id: ConnectionId,
    },
    Offer {
        from: ConnectionId,
        payload: Value,
    },
    Answer {
        from: ConnectionId,
        payload: Value,
    },
    IceCandidate {
        from: ConnectionId,
        payload: Value,
    },
    PeerConnectionReady {
        from: ConnectionId,
    },
    PeerConnected {
        from: ConnectionId,
    },
    RoomClosed {
        #[serde(rename = "roomId")]
        room_id: SessionId,
    },
    RoomExpired {
        #[serde(rename = "roomId")]
        room_id: SessionId,
    },
}

/// Acknowledgement payloads. Variant order matters for untagged decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AckResult {
    Joined {
        success: bool,
        role: Role,
        participants: Vec<ConnectionId>,
    },
    LimitReached {
        error: String,
        #[serde(rename = "limitReached")]
        limit_reached: bool,
        remaining: u32,
        #[serde(rename = "resetTime")]
        reset_time: u64,
    },
    Created {
        #[serde(rename = "roomId")]
        room_id: SessionId,
        #[serde(rename = "expiresAt")]
        expires_at: u64,
    },
    Failure {
        error: String,
    },
    Done {
        success: bool,
    },
}

impl AckResult {
    pub fn done() -> Self {
        AckResult::Done { success: true }
    }

    /// Turn failure payloads back into errors
    pub fn into_result(self) -> Result<AckResult, RelayError> {
        match self {
            AckResult::LimitReached {
                remaining,
                reset_time,
                ..
            } => Err(RelayError::LimitReached {
                remaining,
                reset_time,
            }),
            AckResult::Failure { error } => Err(RelayError::from_message(&error)),
            other => Ok(other),
        }
    }
}

impl From<&RelayError> for AckResult {
    fn from(err: &RelayError) -> Self {
        match err {
            RelayError::LimitReached {
                remaining,
                reset_time,
            } => AckResult::LimitReached {
                error: err.to_string(),
                limit_reached: true,
                remaining: *remaining,
                reset_time: *reset_time,
            },
            other => AckResult::Failure {
                error: other.to_string(),
            },
        }
    }
}

impl<T: Into<AckResult>> From<Result<T, RelayError>> for AckResult {
    fn from(result: Result<T, RelayError>) -> Self {
        match result {
            Ok(ok) => ok.into(),
            Err(err) => AckResult::from(&err),
        }
    }
}

/// Anything the relay writes to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Ack { ack: u64, result: AckResult },
    Event(RelayEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_create_room_without_data() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"id":1,"event":"create-room"}"#).unwrap();
        assert_eq!(frame.id, Some(1));
        assert_eq!(frame.request, ClientRequest::CreateRoom);
    }

    #[test]
    fn test_parse_join_room() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"id":2,"event":"join-room","data":{"roomId":"ab12cd34"}}"#)
                .unwrap();
        match frame.request {
            ClientRequest::JoinRoom { room_id } => assert_eq!(room_id.as_str(), "ab12cd34"),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_signal_payload_is_opaque() {
        let payload = json!({"type": "offer", "sdp": "v=0\r\n", "extra": [1, 2, 3]});
        let frame = ClientFrame {
            id: None,
            request: ClientRequest::Offer {
                room_id: SessionId::new("AB12CD34"),
                payload: payload.clone(),
            },
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(!text.contains("\"id\""));
        let parsed: ClientFrame = serde_json::from_str(&text).unwrap();
        match parsed.request {
            ClientRequest::Offer { payload: p, .. } => assert_eq!(p, payload),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_event_shape() {
        let event = ServerFrame::Event(RelayEvent::UserJoined {
            user_id: ConnectionId(4),
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "user-joined", "data": {"userId": 4}})
        );
    }

    #[test]
    fn test_ack_decoding_picks_right_variant() {
        let full: ServerFrame =
            serde_json::from_str(r#"{"ack":3,"result":{"error":"Room is full"}}"#).unwrap();
        match full {
            ServerFrame::Ack { ack, result } => {
                assert_eq!(ack, 3);
                assert_eq!(result.into_result(), Err(RelayError::Full));
            }
            other => panic!("unexpected frame {:?}", other),
        }

        let limited = AckResult::from(&RelayError::LimitReached {
            remaining: 0,
            reset_time: 1_700_000_000_000,
        });
        let text = serde_json::to_string(&limited).unwrap();
        assert!(text.contains("\"limitReached\":true"));
        assert!(text.contains("\"resetTime\":1700000000000"));
        let back: AckResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back, limited);

        let joined: AckResult = serde_json::from_str(
            r#"{"success":true,"role":"responder","participants":[1,2]}"#,
        )
        .unwrap();
        assert!(matches!(joined, AckResult::Joined { role: Role::Responder, .. }));

        let done: AckResult = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert_eq!(done, AckResult::done());
    }
}
