//! HTTP sender: uploads a file chunk by chunk through an [`UploadApi`].

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use fireside_protocol::{TransferStatus, chunk_len, chunk_offset, num_chunks};
use fireside_transfer::{
    BitrateConfig, BitrateTracker, EventBus, FileHandle, StoreError, Subscribe, TickHandle,
    TransferError, TransferEvent, TransferStore, TransferSummary, UploadSnapshot, spawn_ticker,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiError, UploadApi};
use crate::backoff::{RetryBackoff, RetryConfig};

/// Most chunks a single upload may be split into.
pub const MAX_CHUNKS: u64 = 10_000;

/// Smallest chunk the server accepts (5 MiB).
pub const MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Chunk size for a file of `filesize` bytes.
pub fn http_chunk_size(filesize: u64) -> u64 {
    filesize.div_ceil(MAX_CHUNKS).max(MIN_CHUNK_SIZE)
}

/// Errors that end an upload run.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload aborted")]
    Aborted,

    #[error("upload is already running")]
    AlreadyRunning,

    #[error("no source file attached")]
    MissingFile,

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("file error: {0}")]
    File(#[from] TransferError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Collaborators shared by HTTP senders.
#[derive(Clone)]
pub struct UploadContext {
    pub store: TransferStore,
    pub api: Arc<dyn UploadApi>,
    pub retry: RetryConfig,
    pub bitrate: BitrateConfig,
}

/// Uploads one file. Cheap to clone.
#[derive(Clone)]
pub struct HttpSender {
    inner: Arc<Inner>,
}

struct Inner {
    file_id: String,
    store: TransferStore,
    api: Arc<dyn UploadApi>,
    retry: RetryConfig,
    tick_interval: Duration,
    events: EventBus,
    cancel: CancellationToken,
    state: Mutex<State>,
}

struct State {
    status: TransferStatus,
    file: Option<Arc<dyn FileHandle>>,
    num_uploaded_chunks: u32,
    upload_id: Option<String>,
    aborted: bool,
    running: bool,
    bitrate: BitrateTracker,
    completed_at: Option<SystemTime>,
    file_url: Option<String>,
}

impl State {
    fn snapshot(&self) -> UploadSnapshot {
        UploadSnapshot {
            num_uploaded_chunks: self.num_uploaded_chunks,
            upload_id: self.upload_id.clone(),
        }
    }

    fn uploaded_bytes(&self) -> Option<u64> {
        let size = self.file.as_ref()?.filesize();
        Some((u64::from(self.num_uploaded_chunks) * http_chunk_size(size)).min(size))
    }
}

impl HttpSender {
    /// Creates a sender, resuming from any snapshot saved for `file_id`.
    ///
    /// `file` may be `None` for a restored upload whose source has not been
    /// re-attached yet.
    pub fn new(
        file_id: impl Into<String>,
        file: Option<Arc<dyn FileHandle>>,
        ctx: UploadContext,
    ) -> Result<Self, UploadError> {
        let file_id = file_id.into();
        let snapshot = ctx.store.load_upload(&file_id)?.unwrap_or_default();
        debug!(
            file_id = %file_id,
            uploaded = snapshot.num_uploaded_chunks,
            upload_id = ?snapshot.upload_id,
            "http sender created"
        );

        let state = State {
            status: TransferStatus::Disconnected,
            file,
            num_uploaded_chunks: snapshot.num_uploaded_chunks,
            upload_id: snapshot.upload_id,
            aborted: false,
            running: false,
            bitrate: BitrateTracker::new(&ctx.bitrate),
            completed_at: None,
            file_url: None,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                file_id,
                store: ctx.store,
                api: ctx.api,
                retry: ctx.retry,
                tick_interval: ctx.bitrate.tick_interval,
                events: EventBus::new(),
                cancel: CancellationToken::new(),
                state: Mutex::new(state),
            }),
        })
    }

    /// Recreates a sender from a room-list entry.
    pub fn restore(
        file_id: impl Into<String>,
        status: TransferStatus,
        file: Option<Arc<dyn FileHandle>>,
        ctx: UploadContext,
    ) -> Result<Self, UploadError> {
        let sender = Self::new(file_id, file, ctx)?;
        if status.is_complete() {
            sender.inner.state.lock().unwrap().status = TransferStatus::Completed;
        }
        Ok(sender)
    }

    /// Attaches the source file of a restored upload.
    pub fn attach_file(&self, file: Arc<dyn FileHandle>) {
        self.inner.state.lock().unwrap().file = Some(file);
    }

    pub fn has_file(&self) -> bool {
        self.inner.state.lock().unwrap().file.is_some()
    }

    /// Uploads every remaining chunk and completes the session.
    ///
    /// Returns once the upload completes, is aborted, or fails with a
    /// non-transport error. A completed sender returns `Ok` immediately.
    pub async fn run(&self) -> Result<(), UploadError> {
        let file = {
            let mut st = self.inner.state.lock().unwrap();
            if st.status.is_complete() {
                return Ok(());
            }
            if st.running {
                return Err(UploadError::AlreadyRunning);
            }
            if st.aborted {
                return Err(UploadError::Aborted);
            }
            let file = st.file.clone().ok_or(UploadError::MissingFile)?;
            st.running = true;
            st.status = TransferStatus::InProgress;
            file
        };

        let ticker = self.inner.start_ticker();
        let result = self.inner.upload(file).await;
        drop(ticker);

        {
            let mut st = self.inner.state.lock().unwrap();
            st.running = false;
            if result.is_err() && !st.status.is_complete() {
                st.status = TransferStatus::Disconnected;
            }
        }

        match &result {
            Ok(()) => {}
            Err(UploadError::Aborted) => {
                info!(file_id = %self.inner.file_id, "upload aborted");
                self.inner.events.emit(TransferEvent::Aborted);
            }
            Err(e) => {
                warn!(file_id = %self.inner.file_id, error = %e, "upload failed");
                self.inner.events.emit(TransferEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        self.inner.events.emit(TransferEvent::StateChanged);
        result
    }

    /// Stops the upload and tells the server to discard it.
    ///
    /// A running loop notices at its next iteration (a pending backoff
    /// sleep is cut short) and returns [`UploadError::Aborted`].
    pub async fn abort(&self) -> Result<(), UploadError> {
        let (upload_id, was_running) = {
            let mut st = self.inner.state.lock().unwrap();
            if st.status.is_complete() || st.aborted {
                return Ok(());
            }
            st.aborted = true;
            if !st.running {
                st.status = TransferStatus::Disconnected;
            }
            (st.upload_id.clone(), st.running)
        };
        self.inner.cancel.cancel();

        if let Some(upload_id) = upload_id {
            self.inner
                .api
                .abort(&self.inner.file_id, &upload_id)
                .await?;
        }
        if !was_running {
            info!(file_id = %self.inner.file_id, "upload aborted");
            self.inner.events.emit(TransferEvent::Aborted);
            self.inner.events.emit(TransferEvent::StateChanged);
        }
        Ok(())
    }

    /// Writes the current snapshot to the store.
    pub fn persist(&self) -> Result<(), UploadError> {
        let snapshot = self.inner.state.lock().unwrap().snapshot();
        self.inner
            .store
            .save_upload(&self.inner.file_id, &snapshot)?;
        Ok(())
    }

    pub fn file_id(&self) -> &str {
        &self.inner.file_id
    }

    pub fn status(&self) -> TransferStatus {
        self.inner.state.lock().unwrap().status
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.state.lock().unwrap().aborted
    }

    pub fn num_uploaded_chunks(&self) -> u32 {
        self.inner.state.lock().unwrap().num_uploaded_chunks
    }

    pub fn upload_id(&self) -> Option<String> {
        self.inner.state.lock().unwrap().upload_id.clone()
    }

    /// Chunk count; `None` without a source file.
    pub fn num_chunks(&self) -> Option<u32> {
        let st = self.inner.state.lock().unwrap();
        let size = st.file.as_ref()?.filesize();
        Some(num_chunks(size, http_chunk_size(size)))
    }

    /// Bytes the server has acknowledged; `None` without a source file.
    pub fn uploaded_bytes(&self) -> Option<u64> {
        self.inner.state.lock().unwrap().uploaded_bytes()
    }

    pub fn completed_at(&self) -> Option<SystemTime> {
        self.inner.state.lock().unwrap().completed_at
    }

    /// URL of the uploaded file, if the server returned one on completion.
    pub fn file_url(&self) -> Option<String> {
        self.inner.state.lock().unwrap().file_url.clone()
    }

    /// Throughput in bytes/second over recent chunks.
    pub fn bitrate(&self) -> f64 {
        self.inner.state.lock().unwrap().bitrate.bitrate()
    }

    /// Room-list entry for this sender.
    pub fn summary(&self) -> TransferSummary {
        TransferSummary::HttpSender {
            file_id: self.inner.file_id.clone(),
            status: self.status().persisted(),
        }
    }
}

impl Subscribe for HttpSender {
    fn events(&self) -> &EventBus {
        &self.inner.events
    }
}

impl Inner {
    async fn upload(&self, file: Arc<dyn FileHandle>) -> Result<(), UploadError> {
        let size = file.filesize();
        let chunk_size = http_chunk_size(size);
        let total = num_chunks(size, chunk_size);

        let upload_id = self.session_id().await?;
        info!(
            file_id = %self.file_id,
            upload_id = %upload_id,
            size,
            chunk_size,
            chunks = total,
            "uploading file"
        );
        self.events.emit(TransferEvent::Started);
        self.events.emit(TransferEvent::StateChanged);

        let mut backoff = RetryBackoff::new(self.retry.clone());
        // Bytes of a chunk that failed to send, kept for the retry.
        let mut pending: Option<(u32, Vec<u8>)> = None;

        loop {
            let index = {
                let st = self.state.lock().unwrap();
                if st.aborted {
                    return Err(UploadError::Aborted);
                }
                st.num_uploaded_chunks
            };
            if index >= total {
                break;
            }

            let data = match pending.take() {
                Some((i, data)) if i == index => data,
                _ => {
                    file.read_at(chunk_offset(index, chunk_size), chunk_len(index, size, chunk_size))
                        .await?
                }
            };

            match self.send_chunk(&upload_id, index, &data).await {
                Ok(()) => {
                    backoff.reset();
                    let (snapshot, bytes) = {
                        let mut st = self.state.lock().unwrap();
                        st.num_uploaded_chunks = index + 1;
                        st.bitrate.add_sample(data.len() as u64);
                        (st.snapshot(), st.uploaded_bytes().unwrap_or(0))
                    };
                    self.store.save_upload(&self.file_id, &snapshot)?;
                    debug!(file_id = %self.file_id, index, bytes, "chunk uploaded");
                    self.events.emit(TransferEvent::Progress { bytes, total: size });
                    self.events.emit(TransferEvent::StateChanged);
                }
                Err(e) if e.is_transport() => {
                    let delay = backoff.record_failure();
                    warn!(
                        file_id = %self.file_id,
                        index,
                        attempt = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "chunk upload failed, retrying"
                    );
                    pending = Some((index, data));
                    self.sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let file_url = loop {
            if self.state.lock().unwrap().aborted {
                return Err(UploadError::Aborted);
            }
            match self.api.complete(&self.file_id, &upload_id).await {
                Ok(url) => break url,
                Err(e) if e.is_transport() => {
                    let delay = backoff.record_failure();
                    warn!(file_id = %self.file_id, error = %e, "completing upload failed, retrying");
                    self.sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let snapshot = {
            let mut st = self.state.lock().unwrap();
            st.status = TransferStatus::Completed;
            st.completed_at = Some(SystemTime::now());
            st.file_url = file_url.clone();
            st.snapshot()
        };
        self.store.save_upload(&self.file_id, &snapshot)?;

        info!(file_id = %self.file_id, url = ?file_url, "upload complete");
        self.events.emit(TransferEvent::Complete { file_url });
        Ok(())
    }

    /// Returns the session's upload id, opening a session if none is known.
    async fn session_id(&self) -> Result<String, UploadError> {
        if let Some(id) = self.state.lock().unwrap().upload_id.clone() {
            debug!(file_id = %self.file_id, upload_id = %id, "resuming upload session");
            return Ok(id);
        }

        let id = self.api.initiate(&self.file_id).await?;
        let snapshot = {
            let mut st = self.state.lock().unwrap();
            st.upload_id = Some(id.clone());
            st.snapshot()
        };
        self.store.save_upload(&self.file_id, &snapshot)?;
        Ok(id)
    }

    async fn send_chunk(&self, upload_id: &str, index: u32, data: &[u8]) -> Result<(), ApiError> {
        let url = self.api.chunk_url(&self.file_id, upload_id, index).await?;
        self.api.put_chunk(&url, data).await
    }

    async fn sleep(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Refreshes the bitrate while the upload runs, including during backoff.
    fn start_ticker(self: &Arc<Self>) -> TickHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        spawn_ticker(self.tick_interval, move || {
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().unwrap().bitrate.update();
                inner.events.emit(TransferEvent::StateChanged);
            }
        })
    }
}
