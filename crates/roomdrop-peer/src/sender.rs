//! Sending half of the transfer engine
//!
//! Streams one file over the data channel in fixed-size binary chunks.
//! Between chunks the loop honours pause and cancel, waits for the
//! channel buffer to drain, and sleeps to stay under the tier's byte rate.

use bytes::Bytes;
use roomdrop_core::{ControlMessage, FileInfo, FileSummary, ProtocolError, TransferId};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::budget::ThroughputBudget;
use crate::source::{FileReader, FileSource};
use crate::transport::{DataChannel, Frame, TransportError};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Channel not ready")]
    ChannelNotReady,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Source ended after {read} of {expected} bytes")]
    SourceTruncated { expected: u64, read: u64 },
    #[error("File too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },
    #[error("Transfer not found: {0}")]
    NotFound(TransferId),
    #[error("Transfer {0} is not cancelled and cannot be retried")]
    NotRetryable(TransferId),
}

/// Requested state of a running transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferControl {
    Active,
    Paused,
    /// `by_peer` cancellations are not echoed back
    Cancelled { by_peer: bool },
}

/// Write side of a transfer's control state
#[derive(Debug)]
pub struct ControlHandle {
    tx: watch::Sender<TransferControl>,
}

impl ControlHandle {
    pub fn new() -> (Self, watch::Receiver<TransferControl>) {
        let (tx, rx) = watch::channel(TransferControl::Active);
        (Self { tx }, rx)
    }

    pub fn get(&self) -> TransferControl {
        *self.tx.borrow()
    }

    /// Returns false if the transfer was not active
    pub fn pause(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == TransferControl::Active {
                *state = TransferControl::Paused;
                true
            } else {
                false
            }
        })
    }

    /// Returns false if the transfer was not paused
    pub fn resume(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == TransferControl::Paused {
                *state = TransferControl::Active;
                true
            } else {
                false
            }
        })
    }

    /// Returns false if already cancelled
    pub fn cancel(&self, by_peer: bool) -> bool {
        self.tx.send_if_modified(|state| {
            if matches!(state, TransferControl::Cancelled { .. }) {
                false
            } else {
                *state = TransferControl::Cancelled { by_peer };
                true
            }
        })
    }
}

/// Progress report after each chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendProgress {
    pub bytes_sent: u64,
    /// Smoothed bytes per second
    pub speed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Completed { bytes: u64 },
    Cancelled { bytes_sent: u64 },
}

pub struct TransferSender {
    channel: Arc<dyn DataChannel>,
    budget: ThroughputBudget,
    speed_update_interval: Duration,
    progress: Option<mpsc::UnboundedSender<SendProgress>>,
}

/// Per-file bookkeeping inside `send_file`
struct Outgoing<'a> {
    info: &'a FileInfo,
    sent: u64,
    /// `file-info` is on the wire
    started: bool,
    /// The peer was told about a pause
    paused_notified: bool,
}

impl TransferSender {
    pub fn new(
        channel: Arc<dyn DataChannel>,
        budget: ThroughputBudget,
        speed_update_interval: Duration,
    ) -> Self {
        Self {
            channel,
            budget,
            speed_update_interval,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<SendProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn budget(&self) -> &ThroughputBudget {
        &self.budget
    }

    /// Stream one file to the peer
    ///
    /// A transfer that fails after `file-info` went out is cancelled on the
    /// peer's side before the error is returned.
    pub async fn send_file(
        &self,
        info: &FileInfo,
        source: &dyn FileSource,
        mut control: watch::Receiver<TransferControl>,
    ) -> Result<SendOutcome, TransferError> {
        if !self.channel.is_open() {
            return Err(TransferError::ChannelNotReady);
        }
        let mut file = Outgoing {
            info,
            sent: 0,
            started: false,
            paused_notified: false,
        };

        let result = self.stream(&mut file, source, &mut control).await;
        if let Err(e) = &result {
            if file.started {
                // Let the peer drop its partial copy
                debug!("Transfer {} failed after {} bytes: {}", info.id, file.sent, e);
                let _ = self.send_control(&ControlMessage::cancelled(&info.id)).await;
            }
        }
        result
    }

    async fn stream(
        &self,
        file: &mut Outgoing<'_>,
        source: &dyn FileSource,
        control: &mut watch::Receiver<TransferControl>,
    ) -> Result<SendOutcome, TransferError> {
        let info = file.info;
        let mut reader = source.open().await?;
        let mut meter = self.budget.speed_meter();
        let mut buf = vec![0u8; self.budget.chunk_size];
        let started_at = Instant::now();
        let mut last_update: Option<Instant> = None;

        debug!("Sending {} ({} bytes) as {}", info.name, info.size, info.id);

        while file.sent < info.size {
            if let Some(outcome) = self.hold(file, control).await? {
                return Ok(outcome);
            }

            self.drain().await?;

            let want = (info.size - file.sent).min(self.budget.chunk_size as u64) as usize;
            if let Some(delay) = self.budget.chunk_delay(want) {
                tokio::time::sleep(delay).await;
                if *control.borrow() != TransferControl::Active {
                    continue;
                }
            }

            if !file.started {
                self.send_control(&ControlMessage::FileInfo { file: info.clone() })
                    .await?;
                file.started = true;
            }

            let n = read_chunk(&mut reader, &mut buf[..want]).await?;
            if n == 0 {
                return Err(TransferError::SourceTruncated {
                    expected: info.size,
                    read: file.sent,
                });
            }
            self.send_frame(Frame::Binary(Bytes::copy_from_slice(&buf[..n])))
                .await?;
            file.sent += n as u64;

            let speed = meter.observe(file.sent, started_at.elapsed());
            if let Some(progress) = &self.progress {
                let _ = progress.send(SendProgress {
                    bytes_sent: file.sent,
                    speed,
                });
            }

            let due = last_update.map_or(true, |t| t.elapsed() >= self.speed_update_interval);
            if due {
                self.send_control(&ControlMessage::FileSpeedUpdate {
                    file_id: info.id.clone(),
                    speed,
                    progress: file.sent as f64 * 100.0 / info.size as f64,
                })
                .await?;
                last_update = Some(Instant::now());
            }
        }

        // An empty file still announces itself before completing
        if !file.started {
            self.send_control(&ControlMessage::FileInfo { file: info.clone() })
                .await?;
        }
        self.send_control(&ControlMessage::FileComplete {
            file: FileSummary {
                id: info.id.clone(),
                name: info.name.clone(),
                size: info.size,
            },
        })
        .await?;

        info!("Sent {} ({} bytes)", info.name, file.sent);
        Ok(SendOutcome::Completed { bytes: file.sent })
    }

    /// Apply pause and cancel. Returns an outcome when the transfer must stop.
    async fn hold(
        &self,
        file: &mut Outgoing<'_>,
        control: &mut watch::Receiver<TransferControl>,
    ) -> Result<Option<SendOutcome>, TransferError> {
        loop {
            let state = *control.borrow_and_update();
            match state {
                TransferControl::Active => {
                    if file.paused_notified {
                        self.send_control(&ControlMessage::resumed(&file.info.id))
                            .await?;
                        file.paused_notified = false;
                    }
                    return Ok(None);
                }
                TransferControl::Cancelled { by_peer } => {
                    // Nothing reaches the wire for a transfer that never started
                    if file.started && !by_peer {
                        self.send_control(&ControlMessage::cancelled(&file.info.id))
                            .await?;
                    }
                    debug!("Transfer {} cancelled after {} bytes", file.info.id, file.sent);
                    return Ok(Some(SendOutcome::Cancelled {
                        bytes_sent: file.sent,
                    }));
                }
                TransferControl::Paused => {
                    if file.started && !file.paused_notified {
                        self.send_control(&ControlMessage::paused(&file.info.id))
                            .await?;
                        file.paused_notified = true;
                    }
                    if control.changed().await.is_err() {
                        // Control handle dropped: the transfer was abandoned
                        return Ok(Some(SendOutcome::Cancelled {
                            bytes_sent: file.sent,
                        }));
                    }
                }
            }
        }
    }

    /// Wait for the channel buffer to fall below the low watermark
    async fn drain(&self) -> Result<(), TransferError> {
        if self.channel.buffered_amount().await <= self.budget.high_water {
            return Ok(());
        }
        loop {
            tokio::time::sleep(self.budget.poll_interval).await;
            if !self.channel.is_open() {
                return Err(TransferError::ChannelNotReady);
            }
            if self.channel.buffered_amount().await < self.budget.low_water {
                return Ok(());
            }
        }
    }

    async fn send_control(&self, msg: &ControlMessage) -> Result<(), TransferError> {
        self.send_frame(Frame::Text(msg.encode()?)).await
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), TransferError> {
        match self.channel.send(frame).await {
            Ok(()) => Ok(()),
            Err(_) if !self.channel.is_open() => Err(TransferError::ChannelNotReady),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fill `buf` from the reader, stopping early only at end of input
async fn read_chunk(reader: &mut FileReader, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDataChannel;
    use crate::receiver::{ReceiverEvent, TransferReceiver};
    use crate::source::MemorySource;
    use roomdrop_config::TransferConfig;
    use roomdrop_core::Tier;

    fn info(id: &str, size: u64) -> FileInfo {
        FileInfo {
            id: TransferId::from(id),
            name: "data.bin".to_string(),
            size,
            mime_type: "application/octet-stream".to_string(),
            last_modified: 0,
        }
    }

    fn premium_sender(channel: Arc<MockDataChannel>) -> TransferSender {
        let config = TransferConfig {
            chunk_size: 4,
            ..Default::default()
        };
        TransferSender::new(
            channel,
            ThroughputBudget::for_tier(Tier::Premium, &config),
            Duration::from_millis(50),
        )
    }

    async fn drain_frames(channel: &MockDataChannel) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(20), channel.recv()).await
        {
            frames.push(frame);
        }
        frames
    }

    fn control_types(frames: &[Frame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(text).unwrap();
                    Some(value["type"].as_str().unwrap().to_string())
                }
                Frame::Binary(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_frame_sequence() {
        let (a, b) = MockDataChannel::open_pair("fileTransfer");
        let sender = premium_sender(a);
        let (_handle, control) = ControlHandle::new();
        let source = MemorySource::new(b"0123456789".to_vec());

        let outcome = sender.send_file(&info("1-a", 10), &source, control).await.unwrap();
        assert_eq!(outcome, SendOutcome::Completed { bytes: 10 });

        let frames = drain_frames(&b).await;
        let types = control_types(&frames);
        assert_eq!(types.first().unwrap(), "file-info");
        assert_eq!(types.last().unwrap(), "file-complete");

        let payload: Vec<u8> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::Binary(data) => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(payload, b"0123456789");
        // 4 + 4 + 2
        assert_eq!(
            frames.iter().filter(|f| matches!(f, Frame::Binary(_))).count(),
            3
        );
    }

    #[tokio::test]
    async fn test_empty_file() {
        let (a, b) = MockDataChannel::open_pair("fileTransfer");
        let sender = premium_sender(a);
        let (_handle, control) = ControlHandle::new();
        let source = MemorySource::new(Vec::new());

        let outcome = sender.send_file(&info("1-e", 0), &source, control).await.unwrap();
        assert_eq!(outcome, SendOutcome::Completed { bytes: 0 });
        let frames = drain_frames(&b).await;
        assert_eq!(control_types(&frames), vec!["file-info", "file-complete"]);
    }

    #[tokio::test]
    async fn test_cancel_before_first_chunk_is_silent() {
        let (a, b) = MockDataChannel::open_pair("fileTransfer");
        let sender = premium_sender(a);
        let (handle, control) = ControlHandle::new();
        handle.cancel(false);

        let source = MemorySource::new(vec![7u8; 16]);
        let outcome = sender.send_file(&info("1-c", 16), &source, control).await.unwrap();
        assert_eq!(outcome, SendOutcome::Cancelled { bytes_sent: 0 });
        assert!(drain_frames(&b).await.is_empty());
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let (a, _b) = MockDataChannel::pair("fileTransfer");
        let sender = premium_sender(Arc::new(a));
        let (_handle, control) = ControlHandle::new();
        let source = MemorySource::new(vec![1u8; 8]);
        let result = sender.send_file(&info("1-x", 8), &source, control).await;
        assert!(matches!(result, Err(TransferError::ChannelNotReady)));
    }

    #[tokio::test]
    async fn test_truncated_source_cancels_on_peer() {
        let (a, b) = MockDataChannel::open_pair("fileTransfer");
        let sender = premium_sender(a);
        let (_handle, control) = ControlHandle::new();
        let source = MemorySource::new(vec![1u8; 6]);
        let result = sender.send_file(&info("1-t", 10), &source, control).await;
        assert!(matches!(
            result,
            Err(TransferError::SourceTruncated {
                expected: 10,
                read: 6
            })
        ));

        let frames = drain_frames(&b).await;
        assert_eq!(control_types(&frames).last().unwrap(), "file-cancelled");

        let mut receiver = TransferReceiver::new();
        let mut events = Vec::new();
        for frame in frames {
            if let Some(event) = receiver.handle_frame(frame).unwrap() {
                events.push(event);
            }
        }
        let id = TransferId::from("1-t");
        assert_eq!(events.last(), Some(&ReceiverEvent::Cancelled(id.clone())));
        assert!(receiver.transfer(&id).is_none());
    }

    #[tokio::test]
    async fn test_failure_before_first_chunk_is_silent() {
        let (a, b) = MockDataChannel::open_pair("fileTransfer");
        let sender = premium_sender(a);
        let (_handle, control) = ControlHandle::new();
        let source = crate::source::PathSource::new("/nonexistent/roomdrop/file.bin");
        let result = sender.send_file(&info("1-m", 10), &source, control).await;
        assert!(matches!(result, Err(TransferError::Io(_))));
        assert!(drain_frames(&b).await.is_empty());
    }

    #[test]
    fn test_control_handle_transitions() {
        let (handle, _rx) = ControlHandle::new();
        assert!(!handle.resume());
        assert!(handle.pause());
        assert!(!handle.pause());
        assert!(handle.resume());
        assert!(handle.cancel(false));
        assert!(!handle.cancel(true));
        assert!(!handle.pause());
        assert_eq!(handle.get(), TransferControl::Cancelled { by_peer: false });
    }
}
