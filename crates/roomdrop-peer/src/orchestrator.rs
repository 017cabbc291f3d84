//! Outgoing transfer queue
//!
//! Files are sent one at a time by a single driver task, with a fixed
//! pause between files. Each record keeps its transfer id for as long as
//! it is queued or in flight; finished and cancelled records never give
//! their id to a new transfer.

use roomdrop_config::TransferConfig;
use roomdrop_core::{ControlMessage, FileInfo, Tier, TransferId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::budget::ThroughputBudget;
use crate::sender::{
    ControlHandle, SendOutcome, SendProgress, TransferControl, TransferError, TransferSender,
};
use crate::source::{FileKey, OutgoingFile};
use crate::transport::DataChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Sending,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Cancelled | TransferState::Failed
        )
    }
}

/// Sender-side record of one transfer
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub id: TransferId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub last_modified: u64,
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub started_at: Option<Instant>,
    /// Smoothed bytes per second
    pub speed: f64,
    pub error: Option<String>,
}

impl TransferRecord {
    fn new(id: TransferId, file: &OutgoingFile) -> Self {
        Self {
            id,
            name: file.name.clone(),
            size: file.size,
            mime_type: file.mime_type.clone(),
            last_modified: file.last_modified,
            state: TransferState::Queued,
            bytes_transferred: 0,
            started_at: None,
            speed: 0.0,
            error: None,
        }
    }

    fn file_info(&self) -> FileInfo {
        FileInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            size: self.size,
            mime_type: self.mime_type.clone(),
            last_modified: self.last_modified,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    StateChanged {
        id: TransferId,
        state: TransferState,
    },
    Progress {
        id: TransferId,
        bytes_transferred: u64,
        speed: f64,
    },
    /// The driver stopped: nothing left to send or the channel went away
    Idle,
}

#[derive(Default)]
struct QueueState {
    records: Vec<TransferRecord>,
    queue: VecDeque<TransferId>,
    files: HashMap<TransferId, OutgoingFile>,
    known_ids: HashMap<FileKey, TransferId>,
    /// Transfers currently owned by the driver
    controls: HashMap<TransferId, ControlHandle>,
    channel: Option<Arc<dyn DataChannel>>,
    driver_running: bool,
}

impl QueueState {
    fn record(&self, id: &TransferId) -> Option<&TransferRecord> {
        self.records.iter().find(|r| &r.id == id)
    }

    fn record_mut(&mut self, id: &TransferId) -> Option<&mut TransferRecord> {
        self.records.iter_mut().find(|r| &r.id == id)
    }

    fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.clone().filter(|c| c.is_open())
    }

    /// Take the first queued record, leaving paused ones in place
    fn next_queued(&mut self) -> Option<TransferId> {
        let records = &self.records;
        self.queue.retain(|id| {
            records
                .iter()
                .any(|r| &r.id == id && !r.state.is_terminal())
        });
        let pos = self.queue.iter().position(|id| {
            records
                .iter()
                .any(|r| &r.id == id && r.state == TransferState::Queued)
        })?;
        self.queue.remove(pos)
    }

    /// Drop records whose state matches, with their sources and id slots
    fn forget(&mut self, matches: impl Fn(TransferState) -> bool) {
        let gone: Vec<TransferId> = self
            .records
            .iter()
            .filter(|r| matches(r.state))
            .map(|r| r.id.clone())
            .collect();
        for id in &gone {
            self.files.remove(id);
        }
        self.known_ids.retain(|_, id| !gone.contains(id));
        self.records.retain(|r| !matches(r.state));
    }

    fn has_queued(&self) -> bool {
        self.queue.iter().any(|id| {
            self.record(id)
                .is_some_and(|r| r.state == TransferState::Queued)
        })
    }
}

struct Job {
    info: FileInfo,
    file: OutgoingFile,
    channel: Arc<dyn DataChannel>,
    control: watch::Receiver<TransferControl>,
}

struct Inner {
    state: Mutex<QueueState>,
    budget: ThroughputBudget,
    config: TransferConfig,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl Inner {
    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, record: &mut TransferRecord, state: TransferState) {
        if record.state != state {
            record.state = state;
            self.emit(OrchestratorEvent::StateChanged {
                id: record.id.clone(),
                state,
            });
        }
    }

    async fn next_job(&self) -> Option<Job> {
        let mut st = self.state.lock().await;
        let Some(channel) = st.open_channel() else {
            return self.stop(&mut st);
        };
        let Some(id) = st.next_queued() else {
            return self.stop(&mut st);
        };
        let Some(file) = st.files.get(&id).cloned() else {
            return self.stop(&mut st);
        };
        let (handle, control) = ControlHandle::new();
        st.controls.insert(id.clone(), handle);
        let Some(record) = st.record_mut(&id) else {
            return self.stop(&mut st);
        };
        record.started_at = Some(Instant::now());
        record.bytes_transferred = 0;
        let info = record.file_info();
        self.set_state(record, TransferState::Sending);
        Some(Job {
            info,
            file,
            channel,
            control,
        })
    }

    fn stop(&self, st: &mut QueueState) -> Option<Job> {
        st.driver_running = false;
        self.emit(OrchestratorEvent::Idle);
        None
    }

    /// Record how a transfer ended. Returns false when the driver must stop.
    async fn finish(&self, id: &TransferId, result: Result<SendOutcome, TransferError>) -> bool {
        let mut st = self.state.lock().await;
        st.controls.remove(id);
        let mut keep_going = true;
        let mut release = true;
        if let Some(record) = st.record_mut(id) {
            match result {
                Ok(SendOutcome::Completed { bytes }) => {
                    record.bytes_transferred = bytes;
                    self.set_state(record, TransferState::Completed);
                }
                Ok(SendOutcome::Cancelled { bytes_sent }) => {
                    record.bytes_transferred = bytes_sent;
                    // Already failed when the channel was lost
                    if record.state != TransferState::Failed {
                        self.set_state(record, TransferState::Cancelled);
                        release = false;
                    }
                }
                Err(e) => {
                    warn!("Transfer {} ({}) failed: {}", record.id, record.name, e);
                    keep_going = !matches!(e, TransferError::ChannelNotReady);
                    record.error = Some(e.to_string());
                    self.set_state(record, TransferState::Failed);
                }
            }
        }
        // Cancelled records keep their source so they can be retried
        if release {
            st.files.remove(id);
        }
        if !keep_going {
            self.stop(&mut st);
        }
        keep_going
    }

    async fn apply_progress(&self, id: TransferId, mut progress: mpsc::UnboundedReceiver<SendProgress>) {
        while let Some(update) = progress.recv().await {
            let mut st = self.state.lock().await;
            if let Some(record) = st.record_mut(&id) {
                if record.state.is_terminal() {
                    continue;
                }
                record.bytes_transferred = update.bytes_sent;
                record.speed = update.speed;
            }
            self.emit(OrchestratorEvent::Progress {
                id: id.clone(),
                bytes_transferred: update.bytes_sent,
                speed: update.speed,
            });
        }
    }
}

/// Single driver: at most one transfer is sending at any time
async fn drive(inner: Arc<Inner>) {
    loop {
        let Some(job) = inner.next_job().await else {
            return;
        };
        let id = job.info.id.clone();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let applier = {
            let inner = inner.clone();
            let id = id.clone();
            tokio::spawn(async move { inner.apply_progress(id, progress_rx).await })
        };

        let sender = TransferSender::new(
            job.channel,
            inner.budget.clone(),
            inner.config.speed_update_interval(),
        )
        .with_progress(progress_tx);
        let result = sender
            .send_file(&job.info, job.file.source.as_ref(), job.control)
            .await;
        drop(sender);
        let _ = applier.await;

        if !inner.finish(&id, result).await {
            return;
        }
        let more = inner.state.lock().await.has_queued();
        if more {
            tokio::time::sleep(inner.config.inter_file_delay()).await;
        }
    }
}

/// Queue of outgoing transfers over one data channel
#[derive(Clone)]
pub struct TransferOrchestrator {
    inner: Arc<Inner>,
}

impl TransferOrchestrator {
    pub fn new(tier: Tier, config: TransferConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                budget: ThroughputBudget::for_tier(tier, &config),
                config,
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    pub fn budget(&self) -> &ThroughputBudget {
        &self.inner.budget
    }

    pub async fn records(&self) -> Vec<TransferRecord> {
        self.inner.state.lock().await.records.clone()
    }

    pub async fn record(&self, id: &TransferId) -> Option<TransferRecord> {
        self.inner.state.lock().await.record(id).cloned()
    }

    /// Whether `id` names one of our outgoing transfers
    pub async fn is_outgoing(&self, id: &TransferId) -> bool {
        self.inner.state.lock().await.record(id).is_some()
    }

    pub async fn is_idle(&self) -> bool {
        !self.inner.state.lock().await.driver_running
    }

    /// Wait until the driver has stopped
    pub async fn wait_idle(&self) {
        let mut events = self.subscribe();
        loop {
            if self.is_idle().await {
                return;
            }
            match events.recv().await {
                Ok(OrchestratorEvent::Idle) | Err(broadcast::error::RecvError::Closed) => return,
                _ => {}
            }
        }
    }

    /// Attach or detach the data channel
    ///
    /// Losing the channel fails the transfer in flight; queued records stay
    /// queued and go out once a channel is attached again.
    pub async fn set_channel(&self, channel: Option<Arc<dyn DataChannel>>) {
        let mut st = self.inner.state.lock().await;
        st.channel = channel;
        if st.open_channel().is_none() {
            let in_flight: Vec<TransferId> = st.controls.keys().cloned().collect();
            for id in in_flight {
                if let Some(handle) = st.controls.get(&id) {
                    handle.cancel(true);
                }
                if let Some(record) = st.record_mut(&id) {
                    record.error = Some("Channel closed".to_string());
                    self.inner.set_state(record, TransferState::Failed);
                }
            }
            return;
        }
        self.start_driver(&mut st);
    }

    fn start_driver(&self, st: &mut QueueState) {
        if st.driver_running || !st.has_queued() || st.open_channel().is_none() {
            return;
        }
        st.driver_running = true;
        tokio::spawn(drive(self.inner.clone()));
    }

    /// Queue files for sending, returning their transfer ids in order
    pub async fn enqueue(&self, files: Vec<OutgoingFile>) -> Result<Vec<TransferId>, TransferError> {
        let mut st = self.inner.state.lock().await;
        if st.open_channel().is_none() {
            return Err(TransferError::ChannelNotReady);
        }
        let max = self.inner.config.max_file_size;
        if let Some(file) = files.iter().find(|f| f.size > max) {
            return Err(TransferError::FileTooLarge {
                size: file.size,
                max,
            });
        }

        let mut ids = Vec::with_capacity(files.len());
        for file in files {
            let key = file.key();
            let live = st
                .known_ids
                .get(&key)
                .and_then(|id| st.record(id))
                .filter(|r| !r.state.is_terminal())
                .map(|r| r.id.clone());
            if let Some(id) = live {
                debug!("{} already queued as {}", file.name, id);
                ids.push(id);
                continue;
            }

            let id = TransferId::generate();
            info!("Queued {} ({} bytes) as {}", file.name, file.size, id);
            st.records.push(TransferRecord::new(id.clone(), &file));
            st.queue.push_back(id.clone());
            st.known_ids.insert(key, id.clone());
            st.files.insert(id.clone(), file);
            self.inner.emit(OrchestratorEvent::StateChanged {
                id: id.clone(),
                state: TransferState::Queued,
            });
            ids.push(id);
        }

        self.start_driver(&mut st);
        Ok(ids)
    }

    pub async fn pause(&self, id: &TransferId) -> Result<(), TransferError> {
        let mut st = self.inner.state.lock().await;
        let in_flight = st.controls.get(id).map(|handle| handle.pause());
        let record = st
            .record_mut(id)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;
        match (record.state, in_flight) {
            (TransferState::Sending, Some(true)) | (TransferState::Queued, None) => {
                self.inner.set_state(record, TransferState::Paused);
            }
            (state, _) => debug!("Not pausing {} in state {:?}", id, state),
        }
        Ok(())
    }

    pub async fn resume(&self, id: &TransferId) -> Result<(), TransferError> {
        let mut st = self.inner.state.lock().await;
        let in_flight = st.controls.get(id).map(|handle| handle.resume());
        let record = st
            .record_mut(id)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;
        match (record.state, in_flight) {
            (TransferState::Paused, Some(true)) => {
                self.inner.set_state(record, TransferState::Sending);
            }
            (TransferState::Paused, None) => {
                self.inner.set_state(record, TransferState::Queued);
                self.start_driver(&mut st);
            }
            (state, _) => debug!("Not resuming {} in state {:?}", id, state),
        }
        Ok(())
    }

    pub async fn cancel(&self, id: &TransferId) -> Result<(), TransferError> {
        let mut st = self.inner.state.lock().await;
        self.cancel_locked(&mut st, id, false)
    }

    fn cancel_locked(
        &self,
        st: &mut QueueState,
        id: &TransferId,
        by_peer: bool,
    ) -> Result<(), TransferError> {
        if let Some(handle) = st.controls.get(id) {
            handle.cancel(by_peer);
        }
        let record = st
            .record_mut(id)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;
        if record.state.is_terminal() {
            return Ok(());
        }
        info!("Cancelled {} ({})", record.name, id);
        self.inner.set_state(record, TransferState::Cancelled);
        st.queue.retain(|queued| queued != id);
        Ok(())
    }

    pub async fn pause_all(&self) {
        for id in self.ids_in(&[TransferState::Queued, TransferState::Sending]).await {
            let _ = self.pause(&id).await;
        }
    }

    pub async fn resume_all(&self) {
        for id in self.ids_in(&[TransferState::Paused]).await {
            let _ = self.resume(&id).await;
        }
    }

    pub async fn cancel_all(&self) {
        let mut st = self.inner.state.lock().await;
        let ids: Vec<TransferId> = st
            .records
            .iter()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.id.clone())
            .collect();
        for id in ids {
            let _ = self.cancel_locked(&mut st, &id, false);
        }
    }

    async fn ids_in(&self, states: &[TransferState]) -> Vec<TransferId> {
        self.inner
            .state
            .lock()
            .await
            .records
            .iter()
            .filter(|r| states.contains(&r.state))
            .map(|r| r.id.clone())
            .collect()
    }

    /// Queue a cancelled transfer again under a fresh id
    pub async fn retry(&self, id: &TransferId) -> Result<TransferId, TransferError> {
        let mut st = self.inner.state.lock().await;
        let record = st
            .record(id)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;
        if record.state != TransferState::Cancelled {
            return Err(TransferError::NotRetryable(id.clone()));
        }
        if st.open_channel().is_none() {
            return Err(TransferError::ChannelNotReady);
        }
        let file = st
            .files
            .remove(id)
            .ok_or_else(|| TransferError::NotRetryable(id.clone()))?;

        let fresh = TransferId::generate();
        info!("Retrying {} as {}", file.name, fresh);
        st.records.push(TransferRecord::new(fresh.clone(), &file));
        st.queue.push_back(fresh.clone());
        st.known_ids.insert(file.key(), fresh.clone());
        st.files.insert(fresh.clone(), file);
        self.inner.emit(OrchestratorEvent::StateChanged {
            id: fresh.clone(),
            state: TransferState::Queued,
        });
        self.start_driver(&mut st);
        Ok(fresh)
    }

    /// Forget cancelled records
    pub async fn clear_cancelled(&self) {
        let mut st = self.inner.state.lock().await;
        st.forget(|state| state == TransferState::Cancelled);
    }

    /// Forget every completed, cancelled or failed record
    pub async fn clear_finished(&self) {
        let mut st = self.inner.state.lock().await;
        st.forget(TransferState::is_terminal);
    }

    /// Control frame from the peer about one of our transfers.
    /// Returns false if the id is not ours.
    pub async fn on_peer_control(&self, msg: &ControlMessage) -> bool {
        let mut st = self.inner.state.lock().await;
        let id = msg.transfer_id();
        if st.record(id).is_none() {
            return false;
        }
        match msg {
            // The peer already knows, so it is not echoed
            ControlMessage::FileCancelled { .. } => {
                let _ = self.cancel_locked(&mut st, id, true);
            }
            other => debug!("Ignoring peer control {:?} for outgoing {}", other, id),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDataChannel;
    use crate::transport::Frame;
    use std::time::Duration;

    fn config() -> TransferConfig {
        TransferConfig {
            chunk_size: 1024,
            inter_file_delay_ms: 10,
            max_file_size: 1 << 20,
            ..Default::default()
        }
    }

    async fn with_channel(tier: Tier) -> (TransferOrchestrator, Arc<MockDataChannel>) {
        let orchestrator = TransferOrchestrator::new(tier, config());
        let (a, b) = MockDataChannel::open_pair("fileTransfer");
        orchestrator.set_channel(Some(a)).await;
        (orchestrator, b)
    }

    /// Orchestrator whose driver is marked busy, so queued records stay put
    async fn parked() -> TransferOrchestrator {
        let orchestrator = TransferOrchestrator::new(Tier::Premium, config());
        let (a, _b) = MockDataChannel::open_pair("fileTransfer");
        let mut st = orchestrator.inner.state.lock().await;
        st.channel = Some(a);
        st.driver_running = true;
        drop(st);
        orchestrator
    }

    async fn received(peer: &MockDataChannel) -> Vec<ControlMessage> {
        let mut messages = Vec::new();
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(50), peer.recv()).await
        {
            if let Frame::Text(text) = frame {
                messages.push(ControlMessage::parse(&text).unwrap());
            }
        }
        messages
    }

    #[tokio::test]
    async fn test_requires_channel() {
        let orchestrator = TransferOrchestrator::new(Tier::Anonymous, config());
        let result = orchestrator
            .enqueue(vec![OutgoingFile::from_bytes("a.txt", "hello")])
            .await;
        assert!(matches!(result, Err(TransferError::ChannelNotReady)));
    }

    #[tokio::test]
    async fn test_file_too_large() {
        let orchestrator = parked().await;
        let big = OutgoingFile::from_bytes("big.bin", vec![0u8; (1 << 20) + 1]);
        let result = orchestrator.enqueue(vec![big]).await;
        assert!(matches!(result, Err(TransferError::FileTooLarge { .. })));
        assert!(orchestrator.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_sends_queue_in_order() {
        let (orchestrator, peer) = with_channel(Tier::Premium).await;
        let ids = orchestrator
            .enqueue(vec![
                OutgoingFile::from_bytes("one.txt", vec![1u8; 3000]),
                OutgoingFile::from_bytes("two.txt", vec![2u8; 10]),
            ])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        orchestrator.wait_idle().await;
        for id in &ids {
            let record = orchestrator.record(id).await.unwrap();
            assert_eq!(record.state, TransferState::Completed);
        }
        assert_eq!(
            orchestrator.record(&ids[0]).await.unwrap().bytes_transferred,
            3000
        );

        let names: Vec<String> = received(&peer)
            .await
            .into_iter()
            .filter_map(|msg| match msg {
                ControlMessage::FileInfo { file } => Some(file.name),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["one.txt", "two.txt"]);
    }

    #[tokio::test]
    async fn test_stable_ids() {
        let orchestrator = parked().await;
        let file = OutgoingFile::from_bytes("same.txt", vec![0u8; 100]);

        let first = orchestrator.enqueue(vec![file.clone()]).await.unwrap();
        let again = orchestrator.enqueue(vec![file.clone()]).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(orchestrator.records().await.len(), 1);

        orchestrator.cancel(&first[0]).await.unwrap();
        let fresh = orchestrator.enqueue(vec![file]).await.unwrap();
        assert_ne!(first, fresh);
        assert_eq!(orchestrator.records().await.len(), 2);
    }

    #[tokio::test]
    async fn test_pause_queued_and_resume() {
        let orchestrator = parked().await;
        let ids = orchestrator
            .enqueue(vec![OutgoingFile::from_bytes("q.txt", vec![0u8; 10])])
            .await
            .unwrap();

        orchestrator.pause_all().await;
        assert_eq!(
            orchestrator.record(&ids[0]).await.unwrap().state,
            TransferState::Paused
        );
        orchestrator.resume_all().await;
        assert_eq!(
            orchestrator.record(&ids[0]).await.unwrap().state,
            TransferState::Queued
        );
        orchestrator.cancel_all().await;
        assert_eq!(
            orchestrator.record(&ids[0]).await.unwrap().state,
            TransferState::Cancelled
        );
        assert!(matches!(
            orchestrator.pause(&TransferId::from("0-x")).await,
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_and_retry() {
        let orchestrator = parked().await;
        let ids = orchestrator
            .enqueue(vec![OutgoingFile::from_bytes("r.txt", vec![0u8; 10])])
            .await
            .unwrap();
        let id = ids[0].clone();

        assert!(matches!(
            orchestrator.retry(&id).await,
            Err(TransferError::NotRetryable(_))
        ));
        orchestrator.cancel(&id).await.unwrap();
        assert_eq!(
            orchestrator.record(&id).await.unwrap().state,
            TransferState::Cancelled
        );

        let fresh = orchestrator.retry(&id).await.unwrap();
        assert_ne!(fresh, id);
        assert_eq!(
            orchestrator.record(&fresh).await.unwrap().state,
            TransferState::Queued
        );

        orchestrator.clear_cancelled().await;
        assert!(orchestrator.record(&id).await.is_none());
        assert!(orchestrator.record(&fresh).await.is_some());
    }

    #[tokio::test]
    async fn test_clear_finished_prunes_records_and_ids() {
        let (orchestrator, _peer) = with_channel(Tier::Premium).await;
        let file = OutgoingFile::from_bytes("done.txt", vec![3u8; 64]);
        let first = orchestrator.enqueue(vec![file.clone()]).await.unwrap();
        orchestrator.wait_idle().await;
        assert_eq!(
            orchestrator.record(&first[0]).await.unwrap().state,
            TransferState::Completed
        );

        orchestrator.clear_finished().await;
        assert!(orchestrator.records().await.is_empty());
        {
            let st = orchestrator.inner.state.lock().await;
            assert!(st.known_ids.is_empty());
            assert!(st.files.is_empty());
        }

        let again = orchestrator.enqueue(vec![file]).await.unwrap();
        assert_ne!(first, again);
        orchestrator.wait_idle().await;
    }

    #[tokio::test]
    async fn test_idle_without_trailing_pause() {
        let orchestrator = TransferOrchestrator::new(
            Tier::Premium,
            TransferConfig {
                inter_file_delay_ms: 60_000,
                ..config()
            },
        );
        let (a, _peer) = MockDataChannel::open_pair("fileTransfer");
        orchestrator.set_channel(Some(a)).await;
        let ids = orchestrator
            .enqueue(vec![OutgoingFile::from_bytes("last.txt", vec![9u8; 100])])
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), orchestrator.wait_idle())
            .await
            .expect("no pause after the last file");
        assert_eq!(
            orchestrator.record(&ids[0]).await.unwrap().state,
            TransferState::Completed
        );
    }

    #[tokio::test]
    async fn test_peer_cancel_is_not_echoed() {
        let (orchestrator, peer) = with_channel(Tier::Anonymous).await;
        let ids = orchestrator
            .enqueue(vec![OutgoingFile::from_bytes("p.txt", vec![0u8; 4096])])
            .await
            .unwrap();

        loop {
            match tokio::time::timeout(Duration::from_secs(1), peer.recv()).await {
                Ok(Some(Frame::Binary(_))) => break,
                Ok(Some(_)) => {}
                _ => panic!("no chunk arrived"),
            }
        }

        assert!(
            orchestrator
                .on_peer_control(&ControlMessage::cancelled(&ids[0]))
                .await
        );
        assert!(
            !orchestrator
                .on_peer_control(&ControlMessage::cancelled(&TransferId::from("0-x")))
                .await
        );
        orchestrator.wait_idle().await;
        assert_eq!(
            orchestrator.record(&ids[0]).await.unwrap().state,
            TransferState::Cancelled
        );

        let echoed = received(&peer)
            .await
            .into_iter()
            .filter(|msg| matches!(msg, ControlMessage::FileCancelled { .. }))
            .count();
        assert_eq!(echoed, 0);
    }

    #[tokio::test]
    async fn test_channel_loss_fails_current_only() {
        let (orchestrator, _peer) = with_channel(Tier::Anonymous).await;
        let ids = orchestrator
            .enqueue(vec![
                OutgoingFile::from_bytes("slow.bin", vec![0u8; 100 * 1024]),
                OutgoingFile::from_bytes("next.bin", vec![0u8; 10]),
            ])
            .await
            .unwrap();

        while orchestrator.record(&ids[0]).await.unwrap().state != TransferState::Sending {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        orchestrator.set_channel(None).await;
        orchestrator.wait_idle().await;

        assert_eq!(
            orchestrator.record(&ids[0]).await.unwrap().state,
            TransferState::Failed
        );
        assert_eq!(
            orchestrator.record(&ids[1]).await.unwrap().state,
            TransferState::Queued
        );
    }

    #[tokio::test]
    async fn test_unreadable_source_fails_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gone.txt");
        std::fs::write(&path, b"soon deleted").unwrap();
        let gone = OutgoingFile::from_path(&path).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let (orchestrator, _peer) = with_channel(Tier::Premium).await;
        let ids = orchestrator
            .enqueue(vec![gone, OutgoingFile::from_bytes("ok.txt", vec![5u8; 50])])
            .await
            .unwrap();
        orchestrator.wait_idle().await;

        let failed = orchestrator.record(&ids[0]).await.unwrap();
        assert_eq!(failed.state, TransferState::Failed);
        assert!(failed.error.is_some());
        assert_eq!(
            orchestrator.record(&ids[1]).await.unwrap().state,
            TransferState::Completed
        );
    }
}
