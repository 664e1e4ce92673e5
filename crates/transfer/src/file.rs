//! File capabilities consumed by transfer roles.
//!
//! Senders read from a [`FileHandle`] by byte range; receivers append whole
//! blocks to one. Neither ever creates or deletes caller files except through
//! [`FileStorage::open`].

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::validation::validate_storage_path;
use crate::{BoxFuture, TransferError};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// A readable/appendable file.
pub trait FileHandle: Send + Sync {
    fn filename(&self) -> &str;

    /// Current size in bytes.
    fn filesize(&self) -> u64;

    fn mime_type(&self) -> &str;

    /// Reads up to `len` bytes at `offset`; shorter only at end of file.
    fn read_at(&self, offset: u64, len: u64) -> BoxFuture<'_, Result<Vec<u8>, TransferError>>;

    /// Appends `data` at the end of the file.
    fn append<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<(), TransferError>>;

    /// Shrinks the file to `len` bytes. A no-op when it is already shorter.
    fn truncate(&self, len: u64) -> BoxFuture<'_, Result<(), TransferError>>;
}

/// Opens (creating if needed) destination files by storage path.
pub trait FileStorage: Send + Sync {
    fn open<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Arc<dyn FileHandle>, TransferError>>;
}

/// Looks up source files by transfer id, used to re-attach restored uploads.
pub trait FileSource: Send + Sync {
    fn file_by_id<'a>(
        &'a self,
        file_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Arc<dyn FileHandle>>, TransferError>>;
}

// ---------------------------------------------------------------------------
// LocalFile
// ---------------------------------------------------------------------------

/// A file on the local filesystem.
pub struct LocalFile {
    path: PathBuf,
    filename: String,
    mime_type: String,
    size: AtomicU64,
    // Serializes appends so concurrent writers cannot interleave.
    write_lock: tokio::sync::Mutex<()>,
}

impl LocalFile {
    /// Opens an existing file for reading.
    pub async fn open(
        path: impl Into<PathBuf>,
        mime_type: impl Into<String>,
    ) -> Result<Self, TransferError> {
        let path = path.into();
        let size = tokio::fs::metadata(&path).await?.len();
        Ok(Self::with_size(path, mime_type.into(), size))
    }

    /// Opens `path` for appending, creating it and its parent directories.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let size = file.metadata().await?.len();
        Ok(Self::with_size(path, DEFAULT_MIME_TYPE.into(), size))
    }

    fn with_size(path: PathBuf, mime_type: String, size: u64) -> Self {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            filename,
            mime_type,
            size: AtomicU64::new(size),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>, TransferError> {
        let size = self.filesize();
        let len = len.min(size.saturating_sub(offset));
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(len as usize);
        let read = (&mut file).take(len).read_to_end(&mut buf).await? as u64;
        if read != len {
            return Err(TransferError::ShortRead {
                offset,
                expected: len,
                actual: read,
            });
        }
        Ok(buf)
    }

    async fn append_bytes(&self, data: &[u8]) -> Result<(), TransferError> {
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        let size = self.size.fetch_add(data.len() as u64, Ordering::SeqCst) + data.len() as u64;
        debug!(path = ?self.path, bytes = data.len(), size, "appended to file");
        Ok(())
    }

    async fn truncate_to(&self, len: u64) -> Result<(), TransferError> {
        let _guard = self.write_lock.lock().await;
        if len >= self.filesize() {
            return Ok(());
        }
        let file = tokio::fs::OpenOptions::new().write(true).open(&self.path).await?;
        file.set_len(len).await?;
        file.sync_all().await?;
        self.size.store(len, Ordering::SeqCst);
        debug!(path = ?self.path, size = len, "truncated file");
        Ok(())
    }
}

impl FileHandle for LocalFile {
    fn filename(&self) -> &str {
        &self.filename
    }

    fn filesize(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn read_at(&self, offset: u64, len: u64) -> BoxFuture<'_, Result<Vec<u8>, TransferError>> {
        Box::pin(self.read_range(offset, len))
    }

    fn append<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(self.append_bytes(data))
    }

    fn truncate(&self, len: u64) -> BoxFuture<'_, Result<(), TransferError>> {
        Box::pin(self.truncate_to(len))
    }
}

/// Storage rooted at a local directory.
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileStorage for LocalFileStorage {
    fn open<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Arc<dyn FileHandle>, TransferError>> {
        Box::pin(async move {
            validate_storage_path(path)?;
            let file = LocalFile::create(self.root.join(path)).await?;
            Ok(Arc::new(file) as Arc<dyn FileHandle>)
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryFile
// ---------------------------------------------------------------------------

/// In-memory file that keeps every append as a separate segment.
pub struct MemoryFile {
    filename: String,
    mime_type: String,
    segments: Mutex<Vec<Vec<u8>>>,
}

impl MemoryFile {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::with_contents(filename, mime_type, Vec::new())
    }

    /// A file preloaded with `data` (counted as one segment when non-empty).
    pub fn with_contents(
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        let segments = if data.is_empty() { Vec::new() } else { vec![data] };
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            segments: Mutex::new(segments),
        }
    }

    /// Concatenation of every segment.
    pub fn contents(&self) -> Vec<u8> {
        self.segments.lock().unwrap().concat()
    }

    /// Length of each append, in order.
    pub fn segment_sizes(&self) -> Vec<usize> {
        self.segments.lock().unwrap().iter().map(Vec::len).collect()
    }
}

impl FileHandle for MemoryFile {
    fn filename(&self) -> &str {
        &self.filename
    }

    fn filesize(&self) -> u64 {
        self.segments
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.len() as u64)
            .sum()
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn read_at(&self, offset: u64, len: u64) -> BoxFuture<'_, Result<Vec<u8>, TransferError>> {
        let data = self.contents();
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len as usize).min(data.len());
        let slice = data[start..end].to_vec();
        Box::pin(async move { Ok(slice) })
    }

    fn append<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<(), TransferError>> {
        self.segments.lock().unwrap().push(data.to_vec());
        Box::pin(async { Ok(()) })
    }

    fn truncate(&self, len: u64) -> BoxFuture<'_, Result<(), TransferError>> {
        let mut segments = self.segments.lock().unwrap();
        let mut kept = 0u64;
        segments.retain_mut(|segment| {
            let remaining = len.saturating_sub(kept);
            if remaining == 0 {
                return false;
            }
            segment.truncate(remaining.min(segment.len() as u64) as usize);
            kept += segment.len() as u64;
            true
        });
        Box::pin(async { Ok(()) })
    }
}

/// In-memory [`FileStorage`] that hands out shared [`MemoryFile`]s by path.
#[derive(Default)]
pub struct MemoryFileStorage {
    files: Mutex<HashMap<String, Arc<MemoryFile>>>,
}

impl MemoryFileStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the file previously opened at `path`.
    pub fn file(&self, path: &str) -> Option<Arc<MemoryFile>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    /// Places `file` at `path`, replacing any previous file.
    pub fn insert(&self, path: impl Into<String>, file: Arc<MemoryFile>) {
        self.files.lock().unwrap().insert(path.into(), file);
    }

    pub fn open_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }
}

impl FileStorage for MemoryFileStorage {
    fn open<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Arc<dyn FileHandle>, TransferError>> {
        let result = validate_storage_path(path).map(|()| {
            let mut files = self.files.lock().unwrap();
            let file = files.entry(path.to_string()).or_insert_with(|| {
                let name = Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Arc::new(MemoryFile::new(name, DEFAULT_MIME_TYPE))
            });
            Arc::clone(file) as Arc<dyn FileHandle>
        });
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_file_append_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let file = LocalFile::create(dir.path().join("transfers").join("f1"))
            .await
            .unwrap();
        assert_eq!(file.filesize(), 0);
        assert_eq!(file.filename(), "f1");

        file.append(b"hello ").await.unwrap();
        file.append(b"world").await.unwrap();
        assert_eq!(file.filesize(), 11);

        assert_eq!(file.read_at(6, 5).await.unwrap(), b"world");
        assert_eq!(file.read_at(6, 100).await.unwrap(), b"world");
        assert!(file.read_at(11, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_file_open_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take1.wav");
        std::fs::write(&path, vec![7u8; 40]).unwrap();

        let file = LocalFile::open(&path, "audio/wav").await.unwrap();
        assert_eq!(file.filesize(), 40);
        assert_eq!(file.mime_type(), "audio/wav");
        assert_eq!(file.read_at(30, 16).await.unwrap(), vec![7u8; 10]);
    }

    #[tokio::test]
    async fn local_file_open_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = LocalFile::open(dir.path().join("missing"), "audio/wav").await;
        assert!(matches!(result, Err(TransferError::Io(_))));
    }

    #[tokio::test]
    async fn local_storage_reopens_with_existing_length() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(dir.path());

        let first = storage.open("transfers/abc").await.unwrap();
        first.append(&[1, 2, 3]).await.unwrap();

        let second = storage.open("transfers/abc").await.unwrap();
        assert_eq!(second.filesize(), 3);
        assert!(dir.path().join("transfers/abc").exists());
    }

    #[tokio::test]
    async fn local_storage_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(dir.path());
        let result = storage.open("transfers/../../escape").await;
        assert!(matches!(result, Err(TransferError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn memory_file_tracks_segments() {
        let file = MemoryFile::new("x", "video/webm");
        file.append(&[1, 2]).await.unwrap();
        file.append(&[3]).await.unwrap();
        assert_eq!(file.contents(), vec![1, 2, 3]);
        assert_eq!(file.segment_sizes(), vec![2, 1]);
        assert_eq!(file.filesize(), 3);
        assert_eq!(file.read_at(1, 5).await.unwrap(), vec![2, 3]);
        assert!(file.read_at(9, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_file_truncate_drops_tail() {
        let dir = tempfile::tempdir().unwrap();
        let file = LocalFile::create(dir.path().join("partial")).await.unwrap();
        file.append(&[1, 2, 3, 4, 5]).await.unwrap();

        file.truncate(2).await.unwrap();
        assert_eq!(file.filesize(), 2);
        file.truncate(9).await.unwrap();
        assert_eq!(file.filesize(), 2);

        file.append(&[6]).await.unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap(), vec![1, 2, 6]);
    }

    #[tokio::test]
    async fn memory_file_truncate_cuts_across_segments() {
        let file = MemoryFile::new("x", "video/webm");
        file.append(&[1, 2, 3]).await.unwrap();
        file.append(&[4, 5, 6]).await.unwrap();
        file.append(&[7]).await.unwrap();

        file.truncate(4).await.unwrap();
        assert_eq!(file.contents(), vec![1, 2, 3, 4]);
        assert_eq!(file.segment_sizes(), vec![3, 1]);
    }

    #[tokio::test]
    async fn memory_storage_shares_files_by_path() {
        let storage = MemoryFileStorage::new();
        let a = storage.open("transfers/f").await.unwrap();
        a.append(b"abc").await.unwrap();
        let b = storage.open("transfers/f").await.unwrap();
        assert_eq!(b.filesize(), 3);
        assert_eq!(storage.open_count(), 1);
        assert_eq!(storage.file("transfers/f").unwrap().contents(), b"abc");
    }
}
