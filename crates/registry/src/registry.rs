//! The transfer registry.

use std::sync::{Arc, Mutex, Weak};

use fireside_data_channel::{ChannelEndpoint, PeerReceiver, ReceiverContext};
use fireside_http_upload::{HttpSender, UploadApi, UploadContext};
use fireside_protocol::TransferStatus;
use fireside_transfer::{
    EventBus, EventKind, FileHandle, FileSource, FileStorage, Subscribe, TransferStore,
    TransferSummary,
};
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::peer::{OutgoingTransfer, PeerConnection, send_to_peer};

/// Collaborators a registry needs.
#[derive(Clone)]
pub struct RegistryContext {
    pub store: TransferStore,
    /// Where received files are written.
    pub storage: Arc<dyn FileStorage>,
    /// Source files of restored uploads.
    pub source: Arc<dyn FileSource>,
    pub upload_api: Arc<dyn UploadApi>,
    pub config: RegistryConfig,
}

/// A live, persisted transfer.
#[derive(Clone)]
pub enum Transfer {
    Receiver(PeerReceiver),
    Upload(HttpSender),
}

impl Transfer {
    pub fn file_id(&self) -> &str {
        match self {
            Self::Receiver(r) => r.file_id(),
            Self::Upload(s) => s.file_id(),
        }
    }

    pub fn status(&self) -> TransferStatus {
        match self {
            Self::Receiver(r) => r.status(),
            Self::Upload(s) => s.status(),
        }
    }

    pub fn summary(&self) -> TransferSummary {
        match self {
            Self::Receiver(r) => r.summary(),
            Self::Upload(s) => s.summary(),
        }
    }

    pub fn events(&self) -> &EventBus {
        match self {
            Self::Receiver(r) => r.events(),
            Self::Upload(s) => s.events(),
        }
    }

    /// Whether this transfer is the one `summary` describes.
    fn matches(&self, summary: &TransferSummary) -> bool {
        let same_role = matches!(
            (self, summary),
            (Self::Receiver(_), TransferSummary::PeerReceiver { .. })
                | (Self::Upload(_), TransferSummary::HttpSender { .. })
        );
        same_role && self.file_id() == summary.file_id()
    }
}

/// Owns every receiver and HTTP sender of one room. Cheap to clone.
#[derive(Clone)]
pub struct TransferRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: RegistryContext,
    transfers: Mutex<Vec<Transfer>>,
}

impl TransferRegistry {
    /// Creates an empty registry. Call [`restore`](Self::restore) to load
    /// the room's saved transfers.
    pub fn new(ctx: RegistryContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                transfers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.inner.ctx.config.room_id
    }

    /// Routes an inbound transfer channel from `peer_uid` to the receiver
    /// for `file_id`, creating and persisting one if none exists.
    ///
    /// Must be called from within a tokio runtime.
    pub fn receive_file(
        &self,
        endpoint: ChannelEndpoint,
        peer_uid: &str,
        file_id: &str,
    ) -> Result<PeerReceiver, RegistryError> {
        let (receiver, created) = {
            let mut transfers = self.inner.transfers.lock().unwrap();
            let existing = transfers.iter().find_map(|t| match t {
                Transfer::Receiver(r) if r.file_id() == file_id => Some(r.clone()),
                _ => None,
            });
            match existing {
                Some(receiver) => (receiver, false),
                None => {
                    let receiver = PeerReceiver::new(file_id, self.receiver_context())?;
                    self.watch(receiver.events());
                    transfers.push(Transfer::Receiver(receiver.clone()));
                    (receiver, true)
                }
            }
        };

        if created {
            info!(file_id, peer = peer_uid, "receiving new file");
        } else {
            info!(file_id, peer = peer_uid, "peer reconnected to receiver");
            receiver.set_storage(Arc::clone(&self.inner.ctx.storage));
        }
        receiver.set_channel(endpoint, Some(peer_uid.to_string()));
        if created {
            self.persist()?;
        }
        receiver.start();
        Ok(receiver)
    }

    /// Starts uploading `file` on a new task.
    ///
    /// A previous upload registered under the same id is replaced; progress
    /// saved for the id is resumed.
    pub fn upload_file(
        &self,
        file: Arc<dyn FileHandle>,
        file_id: &str,
    ) -> Result<HttpSender, RegistryError> {
        let sender = HttpSender::new(file_id, Some(file), self.upload_context())?;
        self.watch(sender.events());
        {
            let mut transfers = self.inner.transfers.lock().unwrap();
            let slot = transfers
                .iter()
                .position(|t| matches!(t, Transfer::Upload(s) if s.file_id() == file_id));
            match slot {
                Some(pos) => transfers[pos] = Transfer::Upload(sender.clone()),
                None => transfers.push(Transfer::Upload(sender.clone())),
            }
        }
        self.persist()?;
        info!(file_id, "upload started");
        spawn_upload(sender.clone());
        Ok(sender)
    }

    /// Opens a new channel to `peer` and serves `file` on it.
    ///
    /// Outgoing peer transfers are not persisted: the receiving side drives
    /// resumption.
    pub async fn send_file_to_peer(
        &self,
        peer: &dyn PeerConnection,
        file: Arc<dyn FileHandle>,
    ) -> Result<OutgoingTransfer, RegistryError> {
        let config = self.inner.ctx.config.peer.clone();
        Ok(send_to_peer(peer, file, config).await?)
    }

    /// Saves the room's transfer list.
    pub fn persist(&self) -> Result<(), RegistryError> {
        self.inner.persist()
    }

    /// Rebuilds transfers from the saved room list.
    ///
    /// Entries that are already live are skipped, as are entries that fail
    /// to load. Restored receivers wait for their peer to reconnect;
    /// restored uploads wait for [`resume_upload`](Self::resume_upload).
    pub async fn restore(&self) -> Result<usize, RegistryError> {
        let saved = self.inner.ctx.store.load_room(self.room_id())?;
        let mut restored = 0;

        for summary in saved {
            let live = self
                .inner
                .transfers
                .lock()
                .unwrap()
                .iter()
                .any(|t| t.matches(&summary));
            if live {
                continue;
            }

            let transfer = match self.restore_transfer(&summary).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(file_id = %summary.file_id(), error = %e, "skipping saved transfer");
                    continue;
                }
            };
            self.watch(transfer.events());
            debug!(file_id = %transfer.file_id(), status = ?transfer.status(), "transfer restored");
            self.inner.transfers.lock().unwrap().push(transfer);
            restored += 1;
        }

        info!(room = %self.room_id(), restored, "transfers restored");
        Ok(restored)
    }

    /// Builds the live transfer a saved room-list entry describes.
    pub async fn restore_transfer(
        &self,
        summary: &TransferSummary,
    ) -> Result<Transfer, RegistryError> {
        match summary {
            TransferSummary::PeerReceiver { file_id, uid, .. } => {
                let receiver = PeerReceiver::new(file_id.clone(), self.receiver_context())?;
                receiver.set_peer_uid(uid.clone());
                Ok(Transfer::Receiver(receiver))
            }
            TransferSummary::HttpSender { file_id, status } => {
                let file = self.inner.ctx.source.file_by_id(file_id).await?;
                let sender =
                    HttpSender::restore(file_id.clone(), *status, file, self.upload_context())?;
                Ok(Transfer::Upload(sender))
            }
        }
    }

    /// Incomplete receivers fed by `uid`.
    pub fn receivers_for_uid(&self, uid: &str) -> Vec<PeerReceiver> {
        self.inner
            .transfers
            .lock()
            .unwrap()
            .iter()
            .filter_map(|t| match t {
                Transfer::Receiver(r) => Some(r.clone()),
                Transfer::Upload(_) => None,
            })
            .filter(|r| r.peer_uid().as_deref() == Some(uid) && !r.status().is_complete())
            .collect()
    }

    pub fn receiver(&self, file_id: &str) -> Option<PeerReceiver> {
        self.inner
            .transfers
            .lock()
            .unwrap()
            .iter()
            .find_map(|t| match t {
                Transfer::Receiver(r) if r.file_id() == file_id => Some(r.clone()),
                _ => None,
            })
    }

    pub fn http_sender(&self, file_id: &str) -> Option<HttpSender> {
        self.inner
            .transfers
            .lock()
            .unwrap()
            .iter()
            .find_map(|t| match t {
                Transfer::Upload(s) if s.file_id() == file_id => Some(s.clone()),
                _ => None,
            })
    }

    /// Every live transfer, in registration order.
    pub fn transfers(&self) -> Vec<Transfer> {
        self.inner.transfers.lock().unwrap().clone()
    }

    /// Restarts a restored or failed upload, re-attaching its source file
    /// if needed.
    pub async fn resume_upload(&self, file_id: &str) -> Result<HttpSender, RegistryError> {
        let sender = self
            .http_sender(file_id)
            .ok_or_else(|| RegistryError::NotFound(file_id.to_string()))?;
        if sender.status().is_complete() {
            return Ok(sender);
        }

        if !sender.has_file() {
            let file = self
                .inner
                .ctx
                .source
                .file_by_id(file_id)
                .await?
                .ok_or_else(|| RegistryError::MissingFile(file_id.to_string()))?;
            sender.attach_file(file);
        }
        info!(file_id, uploaded = sender.num_uploaded_chunks(), "resuming upload");
        spawn_upload(sender.clone());
        Ok(sender)
    }

    /// Aborts an upload and tells the server to discard it.
    pub async fn abort_upload(&self, file_id: &str) -> Result<(), RegistryError> {
        let sender = self
            .http_sender(file_id)
            .ok_or_else(|| RegistryError::NotFound(file_id.to_string()))?;
        sender.abort().await?;
        self.persist()
    }

    /// Forgets every transfer for `file_id` and deletes its snapshot.
    ///
    /// A running upload keeps going; abort it first to stop it.
    pub fn remove(&self, file_id: &str) -> Result<bool, RegistryError> {
        let removed = {
            let mut transfers = self.inner.transfers.lock().unwrap();
            let before = transfers.len();
            transfers.retain(|t| t.file_id() != file_id);
            before != transfers.len()
        };
        if !removed {
            return Ok(false);
        }

        self.inner.ctx.store.remove_transfer(file_id)?;
        self.persist()?;
        info!(file_id, "transfer removed");
        Ok(true)
    }

    fn receiver_context(&self) -> ReceiverContext {
        let ctx = &self.inner.ctx;
        ReceiverContext {
            store: ctx.store.clone(),
            storage: Arc::clone(&ctx.storage),
            config: ctx.config.peer.clone(),
            bitrate: ctx.config.bitrate_config(),
        }
    }

    fn upload_context(&self) -> UploadContext {
        let ctx = &self.inner.ctx;
        UploadContext {
            store: ctx.store.clone(),
            api: Arc::clone(&ctx.upload_api),
            retry: ctx.config.retry_config(),
            bitrate: ctx.config.bitrate_config(),
        }
    }

    /// Re-persists the room list whenever a transfer completes.
    fn watch(&self, events: &EventBus) {
        let registry: Weak<Inner> = Arc::downgrade(&self.inner);
        events.subscribe(EventKind::Complete, move |_| {
            let Some(inner) = registry.upgrade() else {
                return;
            };
            if let Err(e) = inner.persist() {
                warn!(error = %e, "failed to persist transfer list");
            }
        });
    }
}

impl Inner {
    fn persist(&self) -> Result<(), RegistryError> {
        let transfers = self.transfers.lock().unwrap().clone();
        let summaries: Vec<TransferSummary> = transfers.iter().map(Transfer::summary).collect();
        self.ctx.store.save_room(&self.ctx.config.room_id, &summaries)?;
        debug!(room = %self.ctx.config.room_id, count = summaries.len(), "transfer list saved");
        Ok(())
    }
}

fn spawn_upload(sender: HttpSender) {
    tokio::spawn(async move {
        if let Err(e) = sender.run().await {
            debug!(file_id = %sender.file_id(), error = %e, "upload task ended");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use fireside_data_channel::{
        ChannelEvent, ChannelMessage, DataChannel, DataChannelError, MemoryEnd, PeerSender,
        PeerTransferConfig, ReadyState, memory_pair, transfer_path,
    };
    use fireside_http_upload::ApiError;
    use fireside_protocol::{ControlMessage, FileMetadata};
    use fireside_transfer::{
        BoxFuture, MemoryFile, MemoryFileStorage, MemoryStore, ReceiverSnapshot, TransferError,
        UploadSnapshot,
    };
    use tokio::sync::mpsc;

    use crate::peer::file_id_from_label;

    const ROOM: &str = "r1";
    const MIB: usize = 1024 * 1024;

    #[derive(Default)]
    struct MemorySource {
        files: Mutex<HashMap<String, Arc<MemoryFile>>>,
    }

    impl FileSource for MemorySource {
        fn file_by_id<'a>(
            &'a self,
            file_id: &'a str,
        ) -> BoxFuture<'a, Result<Option<Arc<dyn FileHandle>>, TransferError>> {
            let file = self
                .files
                .lock()
                .unwrap()
                .get(file_id)
                .map(|f| Arc::clone(f) as Arc<dyn FileHandle>);
            Box::pin(async move { Ok(file) })
        }
    }

    #[derive(Default)]
    struct MockApi {
        calls: Mutex<Vec<String>>,
        fail_puts: AtomicBool,
    }

    impl MockApi {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl UploadApi for MockApi {
        fn initiate<'a>(&'a self, file_id: &'a str) -> BoxFuture<'a, Result<String, ApiError>> {
            self.calls.lock().unwrap().push(format!("initiate {file_id}"));
            Box::pin(async { Ok("upload-1".to_string()) })
        }

        fn chunk_url<'a>(
            &'a self,
            _file_id: &'a str,
            upload_id: &'a str,
            index: u32,
        ) -> BoxFuture<'a, Result<String, ApiError>> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("chunk_url {upload_id} {index}"));
            Box::pin(async move { Ok(format!("mock://{index}")) })
        }

        fn put_chunk<'a>(&'a self, url: &'a str, _data: &'a [u8]) -> BoxFuture<'a, Result<(), ApiError>> {
            self.calls.lock().unwrap().push(format!("put {url}"));
            let result = if self.fail_puts.load(Ordering::SeqCst) {
                Err(ApiError::Transport("offline".into()))
            } else {
                Ok(())
            };
            Box::pin(async move { result })
        }

        fn complete<'a>(
            &'a self,
            _file_id: &'a str,
            upload_id: &'a str,
        ) -> BoxFuture<'a, Result<Option<String>, ApiError>> {
            self.calls.lock().unwrap().push(format!("complete {upload_id}"));
            Box::pin(async { Ok(None) })
        }

        fn abort<'a>(&'a self, _file_id: &'a str, upload_id: &'a str) -> BoxFuture<'a, Result<(), ApiError>> {
            self.calls.lock().unwrap().push(format!("abort {upload_id}"));
            Box::pin(async { Ok(()) })
        }
    }

    /// Peer that opens in-memory channels and keeps the remote ends.
    #[derive(Default)]
    struct MockPeer {
        remotes: Mutex<Vec<MemoryEnd>>,
    }

    impl PeerConnection for MockPeer {
        fn uid(&self) -> &str {
            "peer-9"
        }

        fn open_data_channel<'a>(
            &'a self,
            label: &'a str,
        ) -> BoxFuture<'a, Result<ChannelEndpoint, DataChannelError>> {
            let (local, remote) = memory_pair(label);
            local.channel.open();
            self.remotes.lock().unwrap().push(remote);
            Box::pin(async move { Ok(local.into_endpoint()) })
        }
    }

    struct Fixture {
        store: TransferStore,
        storage: Arc<MemoryFileStorage>,
        source: Arc<MemorySource>,
        api: Arc<MockApi>,
        config: RegistryConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let mut config = RegistryConfig::new(ROOM);
            config.peer = PeerTransferConfig {
                chunk_size: 10,
                chunks_per_block: 4,
                block_cache_size: 4,
            };
            Self {
                store: TransferStore::new(Arc::new(MemoryStore::new())),
                storage: Arc::new(MemoryFileStorage::new()),
                source: Arc::new(MemorySource::default()),
                api: Arc::new(MockApi::default()),
                config,
            }
        }

        fn registry(&self) -> TransferRegistry {
            TransferRegistry::new(RegistryContext {
                store: self.store.clone(),
                storage: self.storage.clone(),
                source: self.source.clone(),
                upload_api: self.api.clone(),
                config: self.config.clone(),
            })
        }

        fn room(&self) -> Vec<TransferSummary> {
            self.store.load_room(ROOM).unwrap()
        }
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn recording(len: usize) -> Arc<MemoryFile> {
        Arc::new(MemoryFile::with_contents("guest.webm", "video/webm", data(len)))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    fn completions(events: &EventBus) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        events.subscribe(EventKind::Complete, move |_| {
            let _ = tx.send(());
        });
        rx
    }

    #[tokio::test]
    async fn receive_file_twice_keeps_one_receiver() {
        let fx = Fixture::new();
        let registry = fx.registry();

        let (local, _remote1) = memory_pair("filetransfer:f1");
        let (first_channel, endpoint) = local.split();
        let first = registry.receive_file(endpoint, "peer-1", "f1").unwrap();
        assert_eq!(
            fx.room(),
            vec![TransferSummary::PeerReceiver {
                file_id: "f1".into(),
                uid: Some("peer-1".into()),
                status: TransferStatus::Disconnected,
            }]
        );

        let (local, _remote2) = memory_pair("filetransfer:f1");
        let second = registry
            .receive_file(local.into_endpoint(), "peer-2", "f1")
            .unwrap();

        assert_eq!(registry.transfers().len(), 1);
        assert_eq!(first_channel.close_calls(), 1);
        assert_eq!(first.peer_uid().as_deref(), Some("peer-2"));
        assert_eq!(second.status(), TransferStatus::InProgress);
        assert_eq!(fx.room().len(), 1);
    }

    #[tokio::test]
    async fn completed_receiver_survives_restore() {
        let fx = Fixture::new();
        let registry = fx.registry();
        let source = recording(95);

        let (local, remote) = memory_pair("filetransfer:f1");
        let receiver = registry
            .receive_file(local.into_endpoint(), "peer-1", "f1")
            .unwrap();
        let mut done = completions(receiver.events());

        remote.channel.open();
        let sender = PeerSender::spawn(source.clone(), remote.into_endpoint(), fx.config.peer.clone());
        tokio::time::timeout(Duration::from_secs(10), done.recv())
            .await
            .unwrap();
        sender.await.unwrap().unwrap();

        assert_eq!(
            fx.room(),
            vec![TransferSummary::PeerReceiver {
                file_id: "f1".into(),
                uid: Some("peer-1".into()),
                status: TransferStatus::Completed,
            }]
        );
        assert_eq!(
            fx.storage.file(&transfer_path("f1")).unwrap().contents(),
            source.contents()
        );

        let restored = fx.registry();
        assert_eq!(restored.restore().await.unwrap(), 1);
        let receiver = restored.receiver("f1").unwrap();
        assert_eq!(receiver.status(), TransferStatus::Completed);
        assert_eq!(receiver.peer_uid().as_deref(), Some("peer-1"));
        assert!(restored.receivers_for_uid("peer-1").is_empty());

        // Restoring again does not duplicate live transfers.
        assert_eq!(restored.restore().await.unwrap(), 0);
        assert_eq!(restored.transfers().len(), 1);
    }

    #[tokio::test]
    async fn receivers_for_uid_lists_incomplete_transfers_from_peer() {
        let fx = Fixture::new();
        fx.store
            .save_receiver(
                "done",
                &ReceiverSnapshot {
                    num_saved_chunks: 10,
                    metadata: Some(FileMetadata {
                        name: "a.webm".into(),
                        size: 95,
                        mime_type: "video/webm".into(),
                    }),
                },
            )
            .unwrap();
        let registry = fx.registry();

        let mut remotes = Vec::new();
        for (uid, file_id) in [("peer-1", "f1"), ("peer-2", "f2"), ("peer-1", "done")] {
            let (local, remote) = memory_pair(&format!("filetransfer:{file_id}"));
            registry
                .receive_file(local.into_endpoint(), uid, file_id)
                .unwrap();
            remotes.push(remote);
        }

        let ids: Vec<String> = registry
            .receivers_for_uid("peer-1")
            .iter()
            .map(|r| r.file_id().to_string())
            .collect();
        assert_eq!(ids, vec!["f1".to_string()]);
        assert_eq!(registry.receiver("done").unwrap().status(), TransferStatus::Completed);
        assert_eq!(remotes[2].channel.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn upload_file_runs_and_persists_completion() {
        let fx = Fixture::new();
        let registry = fx.registry();

        let sender = registry.upload_file(recording(MIB), "u1").unwrap();
        assert!(matches!(
            fx.room()[0],
            TransferSummary::HttpSender { ref file_id, status: TransferStatus::Disconnected } if file_id == "u1"
        ));

        wait_until(|| {
            fx.room()
                == vec![TransferSummary::HttpSender {
                    file_id: "u1".into(),
                    status: TransferStatus::Completed,
                }]
        })
        .await;
        assert_eq!(sender.status(), TransferStatus::Completed);
        assert_eq!(
            fx.api.calls(),
            vec![
                "initiate u1".to_string(),
                "chunk_url upload-1 0".to_string(),
                "put mock://0".to_string(),
                "complete upload-1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn restored_upload_resumes_without_initiate() {
        let fx = Fixture::new();
        fx.store
            .save_upload(
                "f1",
                &UploadSnapshot {
                    num_uploaded_chunks: 5,
                    upload_id: Some("X".into()),
                },
            )
            .unwrap();
        fx.store
            .save_room(
                ROOM,
                &[TransferSummary::HttpSender {
                    file_id: "f1".into(),
                    status: TransferStatus::Disconnected,
                }],
            )
            .unwrap();
        fx.source
            .files
            .lock()
            .unwrap()
            .insert("f1".into(), recording(40 * MIB));

        let registry = fx.registry();
        assert_eq!(registry.restore().await.unwrap(), 1);
        let sender = registry.http_sender("f1").unwrap();
        assert!(sender.has_file());
        assert_eq!(sender.status(), TransferStatus::Disconnected);
        assert!(fx.api.calls().is_empty());

        let mut done = completions(sender.events());
        registry.resume_upload("f1").await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), done.recv())
            .await
            .unwrap();

        let calls = fx.api.calls();
        assert!(calls.iter().all(|c| !c.starts_with("initiate")));
        assert_eq!(calls[0], "chunk_url X 5");
        let puts: Vec<&String> = calls.iter().filter(|c| c.starts_with("put")).collect();
        assert_eq!(puts, vec!["put mock://5", "put mock://6", "put mock://7"]);
        assert_eq!(fx.room()[0].status(), TransferStatus::Completed);
    }

    #[tokio::test]
    async fn resume_without_source_file_fails() {
        let fx = Fixture::new();
        fx.store
            .save_room(
                ROOM,
                &[TransferSummary::HttpSender {
                    file_id: "gone".into(),
                    status: TransferStatus::Disconnected,
                }],
            )
            .unwrap();
        let registry = fx.registry();
        registry.restore().await.unwrap();

        assert!(matches!(
            registry.resume_upload("gone").await,
            Err(RegistryError::MissingFile(id)) if id == "gone"
        ));
        assert!(matches!(
            registry.resume_upload("nope").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_then_remove_upload() {
        let fx = Fixture::new();
        fx.api.fail_puts.store(true, Ordering::SeqCst);
        let registry = fx.registry();

        let sender = registry.upload_file(recording(MIB), "u1").unwrap();
        wait_until(|| sender.upload_id().is_some()).await;

        registry.abort_upload("u1").await.unwrap();
        wait_until(|| sender.status() == TransferStatus::Disconnected).await;
        assert!(sender.is_aborted());
        assert!(fx.api.calls().contains(&"abort upload-1".to_string()));
        assert_eq!(fx.room()[0].status(), TransferStatus::Disconnected);

        assert!(registry.remove("u1").unwrap());
        assert!(!registry.remove("u1").unwrap());
        assert!(registry.transfers().is_empty());
        assert!(fx.room().is_empty());
        assert_eq!(fx.store.load_upload("u1").unwrap(), None);
    }

    #[tokio::test]
    async fn send_file_to_peer_opens_labelled_channel() {
        let fx = Fixture::new();
        let registry = fx.registry();
        let peer = MockPeer::default();

        let outgoing = registry
            .send_file_to_peer(&peer, recording(95))
            .await
            .unwrap();
        assert_eq!(outgoing.peer_uid, "peer-9");
        let id = file_id_from_label(&outgoing.label).unwrap();
        assert_eq!(id.len(), 36);
        assert!(registry.transfers().is_empty());

        let mut remote = peer.remotes.lock().unwrap().pop().unwrap();
        remote
            .channel
            .send(ChannelMessage::Text(
                ControlMessage::RequestMetadata.to_json().unwrap(),
            ))
            .await
            .unwrap();
        let reply = loop {
            match remote.events.recv().await {
                Some(ChannelEvent::Message(ChannelMessage::Text(t))) => {
                    break ControlMessage::from_json(&t).unwrap();
                }
                Some(_) => continue,
                None => panic!("channel ended"),
            }
        };
        assert!(matches!(reply, ControlMessage::Metadata { metadata } if metadata.size == 95));

        remote.channel.close();
        outgoing.task.await.unwrap().unwrap();
    }
}
