//! Data-channel control protocol
//!
//! Control messages travel as JSON text frames; file payload travels as
//! binary frames. The channel framing keeps the two apart, so a payload
//! chunk is never parsed as JSON.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::TransferId;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid control message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Chunk received with no active transfer")]
    UnexpectedChunk,
}

/// Metadata announced before the first chunk of a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: TransferId,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    /// Unix millis
    #[serde(rename = "lastModified", default)]
    pub last_modified: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSummary {
    pub id: TransferId,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub id: TransferId,
}

/// Control frames exchanged over the data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    FileInfo {
        file: FileInfo,
    },
    FileSpeedUpdate {
        #[serde(rename = "fileId")]
        file_id: TransferId,
        /// Smoothed bytes per second
        speed: f64,
        /// Percent, 0..=100
        progress: f64,
    },
    FileComplete {
        file: FileSummary,
    },
    FileCancelled {
        file: FileRef,
    },
    FilePaused {
        file: FileRef,
    },
    FileResumed {
        file: FileRef,
    },
}

impl ControlMessage {
    pub fn cancelled(id: &TransferId) -> Self {
        ControlMessage::FileCancelled {
            file: FileRef { id: id.clone() },
        }
    }

    pub fn paused(id: &TransferId) -> Self {
        ControlMessage::FilePaused {
            file: FileRef { id: id.clone() },
        }
    }

    pub fn resumed(id: &TransferId) -> Self {
        ControlMessage::FileResumed {
            file: FileRef { id: id.clone() },
        }
    }

    /// Transfer this message refers to
    pub fn transfer_id(&self) -> &TransferId {
        match self {
            ControlMessage::FileInfo { file } => &file.id,
            ControlMessage::FileSpeedUpdate { file_id, .. } => file_id,
            ControlMessage::FileComplete { file } => &file.id,
            ControlMessage::FileCancelled { file }
            | ControlMessage::FilePaused { file }
            | ControlMessage::FileResumed { file } => &file.id,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_file_info_shape() {
        let msg = ControlMessage::FileInfo {
            file: FileInfo {
                id: TransferId::from("1700000000000-abc"),
                name: "photo.png".to_string(),
                size: 1024,
                mime_type: "image/png".to_string(),
                last_modified: 42,
            },
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "file-info",
                "file": {
                    "id": "1700000000000-abc",
                    "name": "photo.png",
                    "size": 1024,
                    "type": "image/png",
                    "lastModified": 42
                }
            })
        );
    }

    #[test]
    fn test_speed_update_shape() {
        let msg = ControlMessage::parse(
            r#"{"type":"file-speed-update","fileId":"1-a","speed":2048.5,"progress":12.5}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ControlMessage::FileSpeedUpdate {
                file_id: TransferId::from("1-a"),
                speed: 2048.5,
                progress: 12.5,
            }
        );
    }

    #[test]
    fn test_cancel_tolerates_extra_fields() {
        let msg = ControlMessage::parse(
            r#"{"type":"file-cancelled","file":{"id":"1-a","name":"x.bin","size":3}}"#,
        )
        .unwrap();
        assert_eq!(msg, ControlMessage::cancelled(&TransferId::from("1-a")));
        assert_eq!(msg.transfer_id().as_str(), "1-a");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(ControlMessage::parse("not json").is_err());
        assert!(ControlMessage::parse(r#"{"type":"file-exploded"}"#).is_err());
    }
}
