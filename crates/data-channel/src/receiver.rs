//! Peer receiver: pulls a file block by block and survives reconnects.
//!
//! Status moves `Disconnected -> InProgress -> Completed`. Each bound channel
//! runs one session task. A block is appended to storage in one call and the
//! saved-chunk counter is persisted before the next block is requested, so a
//! dropped channel loses at most the block in flight.

use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use fireside_protocol::{
    ControlMessage, FileMetadata, TransferStatus, decode_chunk, num_chunks,
};
use fireside_transfer::store::TransferSummary;
use fireside_transfer::{
    BitrateConfig, BitrateTracker, EventBus, FileHandle, FileStorage, ReceiverSnapshot, Subscribe,
    TickHandle, TransferEvent, TransferStore, spawn_ticker,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelEndpoint, ChannelEvent, ChannelMessage, DataChannel, ReadyState};
use crate::error::DataChannelError;
use crate::{PeerTransferConfig, transfer_path};

/// Collaborators shared by receivers.
#[derive(Clone)]
pub struct ReceiverContext {
    pub store: TransferStore,
    pub storage: Arc<dyn FileStorage>,
    pub config: PeerTransferConfig,
    pub bitrate: BitrateConfig,
}

/// Receiving end of a peer transfer. Cheap to clone.
#[derive(Clone)]
pub struct PeerReceiver {
    inner: Arc<Inner>,
}

struct Inner {
    file_id: String,
    store: TransferStore,
    config: PeerTransferConfig,
    bitrate_config: BitrateConfig,
    events: EventBus,
    state: Mutex<State>,
}

struct State {
    status: TransferStatus,
    peer_uid: Option<String>,
    metadata: Option<FileMetadata>,
    num_saved_chunks: u32,
    num_downloaded_chunks: u32,
    /// Payloads of chunks past `num_saved_chunks`, not yet appended.
    buffer: Vec<u8>,
    storage: Arc<dyn FileStorage>,
    file: Option<Arc<dyn FileHandle>>,
    channel: Option<Arc<dyn DataChannel>>,
    generation: u64,
    pending: Option<Session>,
    session_cancel: Option<CancellationToken>,
    session_task: Option<JoinHandle<()>>,
    bitrate: BitrateTracker,
    ticker: Option<TickHandle>,
    completed_at: Option<SystemTime>,
}

/// One bound channel.
struct Session {
    generation: u64,
    channel: Arc<dyn DataChannel>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    cancel: CancellationToken,
    previous: Option<JoinHandle<()>>,
}

enum Flow {
    Continue,
    Stop,
}

impl State {
    fn num_chunks(&self, chunk_size: u64) -> Option<u32> {
        self.metadata
            .as_ref()
            .map(|m| num_chunks(m.size, chunk_size))
    }

    fn snapshot(&self) -> ReceiverSnapshot {
        ReceiverSnapshot {
            num_saved_chunks: self.num_saved_chunks,
            metadata: self.metadata.clone(),
        }
    }

    fn downloaded_bytes(&self, chunk_size: u64) -> Option<u64> {
        let meta = self.metadata.as_ref()?;
        if self.num_downloaded_chunks >= num_chunks(meta.size, chunk_size) {
            Some(meta.size)
        } else {
            Some(u64::from(self.num_downloaded_chunks) * chunk_size)
        }
    }

    /// Drops unflushed chunks so the next request starts at the saved point.
    fn rewind(&mut self) {
        self.buffer.clear();
        self.num_downloaded_chunks = self.num_saved_chunks;
    }
}

impl PeerReceiver {
    /// Creates a receiver, loading any snapshot saved for `file_id`.
    pub fn new(file_id: impl Into<String>, ctx: ReceiverContext) -> Result<Self, DataChannelError> {
        let file_id = file_id.into();
        let snapshot = ctx.store.load_receiver(&file_id)?.unwrap_or_default();

        let status = match &snapshot.metadata {
            Some(meta) if snapshot.num_saved_chunks >= num_chunks(meta.size, ctx.config.chunk_size) => {
                TransferStatus::Completed
            }
            _ => TransferStatus::Disconnected,
        };
        debug!(
            file_id = %file_id,
            saved = snapshot.num_saved_chunks,
            ?status,
            "peer receiver created"
        );

        let state = State {
            status,
            peer_uid: None,
            metadata: snapshot.metadata,
            num_saved_chunks: snapshot.num_saved_chunks,
            num_downloaded_chunks: snapshot.num_saved_chunks,
            buffer: Vec::new(),
            storage: ctx.storage,
            file: None,
            channel: None,
            generation: 0,
            pending: None,
            session_cancel: None,
            session_task: None,
            bitrate: BitrateTracker::new(&ctx.bitrate),
            ticker: None,
            completed_at: None,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                file_id,
                store: ctx.store,
                config: ctx.config,
                bitrate_config: ctx.bitrate,
                events: EventBus::new(),
                state: Mutex::new(state),
            }),
        })
    }

    /// Binds a channel from `peer_uid`, replacing any previous one.
    ///
    /// The transfer resumes once [`start`](Self::start) is called. A completed
    /// receiver closes the offered channel and stays completed.
    pub fn set_channel(&self, endpoint: ChannelEndpoint, peer_uid: Option<String>) {
        let ChannelEndpoint { channel, events } = endpoint;
        let mut st = self.inner.state.lock().unwrap();

        if st.status.is_complete() {
            drop(st);
            info!(file_id = %self.inner.file_id, "transfer already complete, closing offered channel");
            channel.close();
            return;
        }

        if let Some(cancel) = st.session_cancel.take() {
            cancel.cancel();
        }
        let previous = match st.pending.take() {
            Some(pending) => pending.previous,
            None => st.session_task.take(),
        };
        let old_channel = st.channel.replace(Arc::clone(&channel));

        st.generation += 1;
        let cancel = CancellationToken::new();
        st.session_cancel = Some(cancel.clone());
        st.pending = Some(Session {
            generation: st.generation,
            channel,
            events,
            cancel,
            previous,
        });
        if peer_uid.is_some() {
            st.peer_uid = peer_uid;
        }
        st.status = TransferStatus::InProgress;
        drop(st);

        if let Some(old) = old_channel {
            old.close();
        }
        info!(file_id = %self.inner.file_id, "channel bound to receiver");
        self.inner.events.emit(TransferEvent::StateChanged);
    }

    /// Replaces the storage the destination file is opened from.
    pub fn set_storage(&self, storage: Arc<dyn FileStorage>) {
        self.inner.state.lock().unwrap().storage = storage;
    }

    /// Starts the session for the most recently bound channel.
    ///
    /// Metadata is requested as soon as the channel is open. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) {
        let mut st = self.inner.state.lock().unwrap();
        let Some(session) = st.pending.take() else {
            debug!(file_id = %self.inner.file_id, "no pending channel to start");
            return;
        };
        let inner = Arc::clone(&self.inner);
        st.session_task = Some(tokio::spawn(inner.run_session(session)));
    }

    /// Writes the current snapshot to the store.
    pub fn persist(&self) -> Result<(), DataChannelError> {
        let snapshot = self.inner.state.lock().unwrap().snapshot();
        self.inner
            .store
            .save_receiver(&self.inner.file_id, &snapshot)?;
        Ok(())
    }

    pub fn file_id(&self) -> &str {
        &self.inner.file_id
    }

    pub fn status(&self) -> TransferStatus {
        self.inner.state.lock().unwrap().status
    }

    pub fn peer_uid(&self) -> Option<String> {
        self.inner.state.lock().unwrap().peer_uid.clone()
    }

    pub fn set_peer_uid(&self, uid: Option<String>) {
        self.inner.state.lock().unwrap().peer_uid = uid;
    }

    pub fn metadata(&self) -> Option<FileMetadata> {
        self.inner.state.lock().unwrap().metadata.clone()
    }

    pub fn num_chunks(&self) -> Option<u32> {
        self.inner
            .state
            .lock()
            .unwrap()
            .num_chunks(self.inner.config.chunk_size)
    }

    pub fn num_saved_chunks(&self) -> u32 {
        self.inner.state.lock().unwrap().num_saved_chunks
    }

    pub fn num_downloaded_chunks(&self) -> u32 {
        self.inner.state.lock().unwrap().num_downloaded_chunks
    }

    /// Bytes received so far; `None` until metadata is known.
    pub fn downloaded_bytes(&self) -> Option<u64> {
        self.inner
            .state
            .lock()
            .unwrap()
            .downloaded_bytes(self.inner.config.chunk_size)
    }

    /// Throughput in bytes/second as of the last tick.
    pub fn bitrate(&self) -> f64 {
        self.inner.state.lock().unwrap().bitrate.bitrate()
    }

    pub fn completed_at(&self) -> Option<SystemTime> {
        self.inner.state.lock().unwrap().completed_at
    }

    /// Room-list entry for this receiver.
    pub fn summary(&self) -> TransferSummary {
        let st = self.inner.state.lock().unwrap();
        TransferSummary::PeerReceiver {
            file_id: self.inner.file_id.clone(),
            uid: st.peer_uid.clone(),
            status: st.status.persisted(),
        }
    }
}

impl Subscribe for PeerReceiver {
    fn events(&self) -> &EventBus {
        &self.inner.events
    }
}

impl Inner {
    async fn run_session(self: Arc<Self>, mut session: Session) {
        if let Some(previous) = session.previous.take() {
            // Let the old session finish committing its block.
            let _ = previous.await;
        }

        {
            let mut st = self.state.lock().unwrap();
            if st.generation != session.generation || st.status.is_complete() {
                return;
            }
            st.rewind();
        }

        let mut requested_metadata = false;
        let mut started = false;
        if session.channel.ready_state() == ReadyState::Open {
            self.request_metadata(&session).await;
            requested_metadata = true;
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = session.cancel.cancelled() => return,
                event = session.events.recv() => event,
            };

            let flow = match event {
                None | Some(ChannelEvent::Close) => {
                    self.handle_disconnect(&session);
                    return;
                }
                Some(ChannelEvent::Open) => {
                    if !requested_metadata {
                        self.request_metadata(&session).await;
                        requested_metadata = true;
                    }
                    Ok(Flow::Continue)
                }
                Some(ChannelEvent::Message(ChannelMessage::Text(text))) => {
                    match ControlMessage::from_json(&text) {
                        Ok(ControlMessage::Metadata { metadata }) if !started => {
                            started = true;
                            self.handle_metadata(&session, metadata).await
                        }
                        Ok(other) => {
                            debug!(kind = other.kind(), "ignoring control message");
                            Ok(Flow::Continue)
                        }
                        Err(e) => {
                            warn!(error = %e, "ignoring malformed control message");
                            Ok(Flow::Continue)
                        }
                    }
                }
                Some(ChannelEvent::Message(ChannelMessage::Binary(frame))) => {
                    self.handle_chunk(&session, &frame).await
                }
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => return,
                Err(e) => {
                    self.fail(&session, e);
                    return;
                }
            }
        }
    }

    fn is_current(&self, session: &Session) -> bool {
        self.state.lock().unwrap().generation == session.generation
    }

    async fn request_metadata(&self, session: &Session) {
        self.send_control(session, ControlMessage::RequestMetadata)
            .await;
    }

    async fn request_block(&self, session: &Session, index: u32) {
        debug!(file_id = %self.file_id, index, "requesting block");
        self.send_control(session, ControlMessage::RequestChunks { index })
            .await;
    }

    async fn send_control(&self, session: &Session, message: ControlMessage) {
        let kind = message.kind();
        let result = match message.to_json() {
            Ok(json) => session.channel.send(ChannelMessage::Text(json)).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            // A closed channel also delivers Close, which ends the session.
            warn!(file_id = %self.file_id, kind, error = %e, "failed to send control message");
        }
    }

    async fn handle_metadata(
        self: &Arc<Self>,
        session: &Session,
        metadata: FileMetadata,
    ) -> Result<Flow, DataChannelError> {
        let (snapshot, storage) = {
            let mut st = self.state.lock().unwrap();
            if st.generation != session.generation {
                return Ok(Flow::Stop);
            }
            if let Some(known) = &st.metadata {
                if known.size != metadata.size {
                    return Err(DataChannelError::MetadataMismatch {
                        expected: known.size,
                        actual: metadata.size,
                    });
                }
            }
            st.metadata = Some(metadata.clone());
            (st.snapshot(), Arc::clone(&st.storage))
        };
        self.store.save_receiver(&self.file_id, &snapshot)?;

        let file = storage.open(&transfer_path(&self.file_id)).await?;
        let chunk_size = self.config.chunk_size;
        let total = num_chunks(metadata.size, chunk_size);

        let snapshot_saved = {
            let st = self.state.lock().unwrap();
            if st.generation != session.generation {
                return Ok(Flow::Stop);
            }
            st.num_saved_chunks
        };
        let stored = file.filesize();
        let reconciled = reconcile_saved_chunks(snapshot_saved, stored, metadata.size, chunk_size);
        if let Reconcile::Truncate { len, .. } = reconciled {
            warn!(
                file_id = %self.file_id,
                stored,
                len,
                "destination holds a partial block, truncating"
            );
            file.truncate(len).await?;
        }

        let (saved, reconciled) = {
            let mut st = self.state.lock().unwrap();
            if st.generation != session.generation {
                return Ok(Flow::Stop);
            }
            let moved = match reconciled {
                Reconcile::Keep => false,
                Reconcile::Adopt(saved) | Reconcile::Truncate { saved, .. } => {
                    st.num_saved_chunks = saved;
                    true
                }
            };
            st.rewind();
            st.file = Some(file);
            st.status = TransferStatus::InProgress;
            st.ticker = Some(self.start_ticker());
            (st.num_saved_chunks, moved.then(|| st.snapshot()))
        };

        if let Some(snapshot) = reconciled {
            info!(
                file_id = %self.file_id,
                from = snapshot_saved,
                saved,
                "saved chunk count reconciled with destination"
            );
            self.store.save_receiver(&self.file_id, &snapshot)?;
        }

        info!(
            file_id = %self.file_id,
            name = %metadata.name,
            size = metadata.size,
            saved,
            chunks = total,
            "receiving file"
        );
        self.events.emit(TransferEvent::Started);
        self.events.emit(TransferEvent::StateChanged);

        if saved >= total {
            self.complete();
            return Ok(Flow::Stop);
        }
        self.request_block(session, saved).await;
        Ok(Flow::Continue)
    }

    async fn handle_chunk(&self, session: &Session, frame: &[u8]) -> Result<Flow, DataChannelError> {
        let (index, payload) = match decode_chunk(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(file_id = %self.file_id, error = %e, "dropping malformed frame");
                return Ok(Flow::Continue);
            }
        };

        let chunk_size = self.config.chunk_size;
        let (progress, flush) = {
            let mut st = self.state.lock().unwrap();
            if st.generation != session.generation {
                return Ok(Flow::Stop);
            }
            let (Some(total), Some(file)) = (st.num_chunks(chunk_size), st.file.clone()) else {
                debug!(file_id = %self.file_id, index, "dropping chunk received before metadata");
                return Ok(Flow::Continue);
            };
            if index != st.num_downloaded_chunks {
                debug!(
                    file_id = %self.file_id,
                    index,
                    expected = st.num_downloaded_chunks,
                    "dropping out-of-order chunk"
                );
                return Ok(Flow::Continue);
            }

            st.buffer.extend_from_slice(payload);
            st.num_downloaded_chunks += 1;
            st.bitrate.add_sample(payload.len() as u64);
            trace!(file_id = %self.file_id, index, len = payload.len(), "chunk received");

            let size = st.metadata.as_ref().map_or(0, |m| m.size);
            let progress = (st.downloaded_bytes(chunk_size).unwrap_or(0), size);
            let unflushed = st.num_downloaded_chunks - st.num_saved_chunks;
            let flush = (unflushed >= self.config.chunks_per_block.max(1)
                || st.num_downloaded_chunks == total)
                .then(|| (std::mem::take(&mut st.buffer), file, st.num_downloaded_chunks, total));
            (progress, flush)
        };

        self.events.emit(TransferEvent::ChunkReceived { index });
        self.events.emit(TransferEvent::Progress {
            bytes: progress.0,
            total: progress.1,
        });

        let Some((data, file, downloaded, total)) = flush else {
            return Ok(Flow::Continue);
        };

        file.append(&data).await?;

        // The block is on disk; commit it even if the channel was replaced.
        let snapshot = {
            let mut st = self.state.lock().unwrap();
            st.num_saved_chunks = st.num_saved_chunks.max(downloaded);
            st.snapshot()
        };
        self.store.save_receiver(&self.file_id, &snapshot)?;
        let saved = snapshot.num_saved_chunks;
        debug!(file_id = %self.file_id, saved, bytes = data.len(), "block written");
        self.events.emit(TransferEvent::Write {
            saved_chunks: saved,
        });

        if saved >= total {
            self.complete();
            return Ok(Flow::Stop);
        }
        if !self.is_current(session) {
            return Ok(Flow::Stop);
        }
        self.request_block(session, saved).await;
        Ok(Flow::Continue)
    }

    fn complete(&self) {
        let (channel, snapshot) = {
            let mut st = self.state.lock().unwrap();
            if st.status.is_complete() {
                return;
            }
            st.status = TransferStatus::Completed;
            st.completed_at = Some(SystemTime::now());
            st.ticker = None;
            st.pending = None;
            st.session_cancel = None;
            (st.channel.take(), st.snapshot())
        };

        if let Err(e) = self.store.save_receiver(&self.file_id, &snapshot) {
            warn!(file_id = %self.file_id, error = %e, "failed to persist completed transfer");
        }
        if let Some(channel) = channel {
            channel.close();
        }

        info!(file_id = %self.file_id, chunks = snapshot.num_saved_chunks, "transfer complete");
        self.events.emit(TransferEvent::Complete { file_url: None });
        self.events.emit(TransferEvent::StateChanged);
    }

    fn handle_disconnect(&self, session: &Session) {
        {
            let mut st = self.state.lock().unwrap();
            if st.generation != session.generation || st.status.is_complete() {
                return;
            }
            st.rewind();
            st.status = TransferStatus::Disconnected;
            st.ticker = None;
            st.channel = None;
            st.session_cancel = None;
            st.bitrate.reset();
        }

        info!(file_id = %self.file_id, "peer channel closed, transfer paused");
        self.events.emit(TransferEvent::Disconnected);
        self.events.emit(TransferEvent::StateChanged);
    }

    fn fail(&self, session: &Session, error: DataChannelError) {
        let channel = {
            let mut st = self.state.lock().unwrap();
            if st.generation != session.generation || st.status.is_complete() {
                return;
            }
            st.rewind();
            st.status = TransferStatus::Disconnected;
            st.ticker = None;
            st.session_cancel = None;
            st.bitrate.reset();
            st.channel.take()
        };

        warn!(file_id = %self.file_id, error = %error, "peer transfer failed");
        if let Some(channel) = channel {
            channel.close();
        }
        self.events.emit(TransferEvent::Error {
            message: error.to_string(),
        });
        self.events.emit(TransferEvent::StateChanged);
    }

    fn start_ticker(self: &Arc<Self>) -> TickHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        spawn_ticker(self.bitrate_config.tick_interval, move || {
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().unwrap().bitrate.update();
                inner.events.emit(TransferEvent::StateChanged);
            }
        })
    }
}

/// How a destination's stored length lines up with the saved-chunk count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reconcile {
    Keep,
    /// The destination ends on a chunk boundary other than the snapshot's.
    Adopt(u32),
    /// The destination ends inside a chunk; cut it back to `len`.
    Truncate { saved: u32, len: u64 },
}

/// Matches the saved-chunk count to what the destination really holds.
///
/// A crash between append and persist leaves whole blocks past the snapshot,
/// which are adopted. A torn append leaves a partial chunk, which is cut back
/// to the snapshot (or to the last whole chunk when the file shrank).
fn reconcile_saved_chunks(saved: u32, stored: u64, size: u64, chunk_size: u64) -> Reconcile {
    if chunk_size == 0 {
        return Reconcile::Keep;
    }
    let saved_bytes = (u64::from(saved) * chunk_size).min(size);
    if stored == saved_bytes {
        return Reconcile::Keep;
    }
    if stored <= size && (stored % chunk_size == 0 || stored == size) {
        return Reconcile::Adopt(num_chunks(stored, chunk_size));
    }
    let len = if stored > saved_bytes {
        saved_bytes
    } else {
        stored - stored % chunk_size
    };
    Reconcile::Truncate {
        saved: num_chunks(len, chunk_size),
        len,
    }
}
