//! Receiving half of the transfer engine
//!
//! Mirrors the sender's records from the control frames and reassembles
//! binary chunks in arrival order. The channel is ordered and reliable, so
//! chunks belong to the transfer most recently announced by `file-info`.

use bytes::{Bytes, BytesMut};
use roomdrop_core::{ControlMessage, FileInfo, ProtocolError, TransferId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::sender::TransferError;
use crate::transport::Frame;

/// Receiver-side view of one transfer
#[derive(Debug, Clone)]
pub struct IncomingTransfer {
    pub info: FileInfo,
    pub received: u64,
    /// Last speed reported by the sender, bytes per second
    pub speed: f64,
    pub paused: bool,
    pub started_at: Instant,
}

impl IncomingTransfer {
    fn new(info: FileInfo) -> Self {
        Self {
            info,
            received: 0,
            speed: 0.0,
            paused: false,
            started_at: Instant::now(),
        }
    }

    /// Percent received
    pub fn progress(&self) -> f64 {
        if self.info.size == 0 {
            return 100.0;
        }
        self.received as f64 * 100.0 / self.info.size as f64
    }

    /// Time left at the sender's reported speed
    pub fn eta(&self) -> Option<Duration> {
        if self.speed <= 0.0 || self.paused {
            return None;
        }
        let remaining = self.info.size.saturating_sub(self.received);
        Some(Duration::from_secs_f64(remaining as f64 / self.speed))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    Started(FileInfo),
    Progress {
        id: TransferId,
        received: u64,
        speed: f64,
        eta: Option<Duration>,
    },
    Paused(TransferId),
    Resumed(TransferId),
    Completed {
        info: FileInfo,
        data: Bytes,
    },
    Cancelled(TransferId),
    Failed {
        id: TransferId,
        reason: String,
    },
}

#[derive(Default)]
pub struct TransferReceiver {
    transfers: HashMap<TransferId, IncomingTransfer>,
    current: Option<TransferId>,
    buffer: BytesMut,
}

impl TransferReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transfer(&self, id: &TransferId) -> Option<&IncomingTransfer> {
        self.transfers.get(id)
    }

    pub fn transfers(&self) -> impl Iterator<Item = &IncomingTransfer> {
        self.transfers.values()
    }

    pub fn handle_frame(&mut self, frame: Frame) -> Result<Option<ReceiverEvent>, TransferError> {
        match frame {
            Frame::Binary(chunk) => self.handle_chunk(chunk).map(Some),
            Frame::Text(text) => self.handle_control(ControlMessage::parse(&text)?),
        }
    }

    pub fn handle_control(
        &mut self,
        msg: ControlMessage,
    ) -> Result<Option<ReceiverEvent>, TransferError> {
        let event = match msg {
            ControlMessage::FileInfo { file } => {
                if let Some(previous) = self.current.take() {
                    if self.transfers.remove(&previous).is_some() {
                        warn!("Transfer {} superseded before completing", previous);
                    }
                }
                debug!("Receiving {} ({} bytes) as {}", file.name, file.size, file.id);
                self.buffer = BytesMut::with_capacity(file.size.min(64 * 1024 * 1024) as usize);
                self.current = Some(file.id.clone());
                self.transfers
                    .insert(file.id.clone(), IncomingTransfer::new(file.clone()));
                Some(ReceiverEvent::Started(file))
            }
            ControlMessage::FileSpeedUpdate { file_id, speed, .. } => {
                self.transfers.get_mut(&file_id).map(|transfer| {
                    transfer.speed = speed;
                    ReceiverEvent::Progress {
                        id: file_id.clone(),
                        received: transfer.received,
                        speed,
                        eta: transfer.eta(),
                    }
                })
            }
            ControlMessage::FileComplete { file } => {
                let Some(transfer) = self.transfers.remove(&file.id) else {
                    warn!("Completion for unknown transfer {}", file.id);
                    return Ok(None);
                };
                if self.current.as_ref() == Some(&file.id) {
                    self.current = None;
                }
                let data = std::mem::take(&mut self.buffer).freeze();
                if data.len() as u64 != transfer.info.size {
                    warn!(
                        "Transfer {} ended with {} of {} bytes",
                        file.id,
                        data.len(),
                        transfer.info.size
                    );
                    Some(ReceiverEvent::Failed {
                        id: file.id,
                        reason: format!(
                            "received {} of {} bytes",
                            data.len(),
                            transfer.info.size
                        ),
                    })
                } else {
                    Some(ReceiverEvent::Completed {
                        info: transfer.info,
                        data,
                    })
                }
            }
            ControlMessage::FileCancelled { file } => {
                self.discard(&file.id).then(|| ReceiverEvent::Cancelled(file.id))
            }
            ControlMessage::FilePaused { file } => self.transfers.get_mut(&file.id).map(|t| {
                t.paused = true;
                ReceiverEvent::Paused(file.id)
            }),
            ControlMessage::FileResumed { file } => self.transfers.get_mut(&file.id).map(|t| {
                t.paused = false;
                ReceiverEvent::Resumed(file.id)
            }),
        };
        Ok(event)
    }

    fn handle_chunk(&mut self, chunk: Bytes) -> Result<ReceiverEvent, TransferError> {
        let transfer = self
            .current
            .as_ref()
            .and_then(|id| self.transfers.get_mut(id))
            .ok_or(ProtocolError::UnexpectedChunk)?;
        self.buffer.extend_from_slice(&chunk);
        transfer.received += chunk.len() as u64;
        Ok(ReceiverEvent::Progress {
            id: transfer.info.id.clone(),
            received: transfer.received,
            speed: transfer.speed,
            eta: transfer.eta(),
        })
    }

    /// Drop one transfer and any partial data. Returns false if unknown.
    pub fn discard(&mut self, id: &TransferId) -> bool {
        if self.current.as_ref() == Some(id) {
            self.current = None;
            self.buffer.clear();
        }
        self.transfers.remove(id).is_some()
    }

    /// Forget everything without notifying anyone
    pub fn reset(&mut self) {
        self.transfers.clear();
        self.current = None;
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomdrop_core::FileSummary;

    fn file_info(id: &str, size: u64) -> FileInfo {
        FileInfo {
            id: TransferId::from(id),
            name: "photo.png".to_string(),
            size,
            mime_type: "image/png".to_string(),
            last_modified: 0,
        }
    }

    fn text(msg: ControlMessage) -> Frame {
        Frame::Text(msg.encode().unwrap())
    }

    fn complete(id: &str, size: u64) -> Frame {
        text(ControlMessage::FileComplete {
            file: FileSummary {
                id: TransferId::from(id),
                name: "photo.png".to_string(),
                size,
            },
        })
    }

    #[test]
    fn test_assembles_in_order() {
        let mut rx = TransferReceiver::new();
        let started = rx
            .handle_frame(text(ControlMessage::FileInfo {
                file: file_info("1-a", 6),
            }))
            .unwrap();
        assert_eq!(started, Some(ReceiverEvent::Started(file_info("1-a", 6))));

        rx.handle_frame(Frame::Binary(Bytes::from_static(b"abc"))).unwrap();
        rx.handle_frame(Frame::Binary(Bytes::from_static(b"def"))).unwrap();
        assert_eq!(rx.transfer(&TransferId::from("1-a")).unwrap().received, 6);

        match rx.handle_frame(complete("1-a", 6)).unwrap() {
            Some(ReceiverEvent::Completed { info, data }) => {
                assert_eq!(info.name, "photo.png");
                assert_eq!(&data[..], b"abcdef");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rx.transfers().count(), 0);
    }

    #[test]
    fn test_size_mismatch_fails() {
        let mut rx = TransferReceiver::new();
        rx.handle_frame(text(ControlMessage::FileInfo {
            file: file_info("1-a", 10),
        }))
        .unwrap();
        rx.handle_frame(Frame::Binary(Bytes::from_static(b"abc"))).unwrap();
        assert!(matches!(
            rx.handle_frame(complete("1-a", 10)).unwrap(),
            Some(ReceiverEvent::Failed { .. })
        ));
    }

    #[test]
    fn test_chunk_without_transfer() {
        let mut rx = TransferReceiver::new();
        let result = rx.handle_frame(Frame::Binary(Bytes::from_static(b"x")));
        assert!(matches!(
            result,
            Err(TransferError::Protocol(ProtocolError::UnexpectedChunk))
        ));
    }

    #[test]
    fn test_cancel_discards() {
        let mut rx = TransferReceiver::new();
        rx.handle_frame(text(ControlMessage::FileInfo {
            file: file_info("1-a", 10),
        }))
        .unwrap();
        rx.handle_frame(Frame::Binary(Bytes::from_static(b"abc"))).unwrap();
        let event = rx
            .handle_frame(text(ControlMessage::cancelled(&TransferId::from("1-a"))))
            .unwrap();
        assert_eq!(event, Some(ReceiverEvent::Cancelled(TransferId::from("1-a"))));
        assert!(rx.handle_frame(Frame::Binary(Bytes::from_static(b"d"))).is_err());
        // A second cancel for the same id is a no-op
        assert_eq!(
            rx.handle_frame(text(ControlMessage::cancelled(&TransferId::from("1-a"))))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_eta_from_reported_speed() {
        let mut rx = TransferReceiver::new();
        rx.handle_frame(text(ControlMessage::FileInfo {
            file: file_info("1-a", 4000),
        }))
        .unwrap();
        rx.handle_frame(Frame::Binary(Bytes::from(vec![0u8; 1000]))).unwrap();
        let event = rx
            .handle_frame(text(ControlMessage::FileSpeedUpdate {
                file_id: TransferId::from("1-a"),
                speed: 1000.0,
                progress: 25.0,
            }))
            .unwrap();
        assert_eq!(
            event,
            Some(ReceiverEvent::Progress {
                id: TransferId::from("1-a"),
                received: 1000,
                speed: 1000.0,
                eta: Some(Duration::from_secs(3)),
            })
        );

        rx.handle_frame(text(ControlMessage::paused(&TransferId::from("1-a"))))
            .unwrap();
        let transfer = rx.transfer(&TransferId::from("1-a")).unwrap();
        assert!(transfer.paused);
        assert_eq!(transfer.eta(), None);
        assert_eq!(transfer.progress(), 25.0);
    }

    #[test]
    fn test_reset_is_silent() {
        let mut rx = TransferReceiver::new();
        rx.handle_frame(text(ControlMessage::FileInfo {
            file: file_info("1-a", 10),
        }))
        .unwrap();
        rx.reset();
        assert_eq!(rx.transfers().count(), 0);
        assert!(rx.handle_frame(Frame::Binary(Bytes::from_static(b"x"))).is_err());
    }

    #[test]
    fn test_rejects_bad_control() {
        let mut rx = TransferReceiver::new();
        assert!(matches!(
            rx.handle_frame(Frame::Text("{".to_string())),
            Err(TransferError::Protocol(_))
        ));
    }
}
