//! Key/value persistence for transfer snapshots.
//!
//! Values are JSON strings stored under:
//!
//! - `filetransfer:{fileId}`: a [`ReceiverSnapshot`] or [`UploadSnapshot`]
//! - `filetransfer:forRoom:{roomId}`: a list of [`TransferSummary`]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use fireside_protocol::{FileMetadata, TransferStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors from snapshot stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// String key/value store with atomic per-key replacement.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Volatile store, used in tests and by applications without durable storage.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.read().unwrap().keys().cloned().collect()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.read().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values.write().unwrap().remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object on disk.
///
/// Values are cached in memory; every write rewrites the file through a
/// temporary sibling and a rename, so readers never observe a torn file.
pub struct JsonFileStore {
    path: PathBuf,
    values: RwLock<HashMap<String, String>>,
}

impl JsonFileStore {
    /// Opens the store, loading existing values from `path` if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = load_values(&path)?;
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &HashMap<String, String>) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(values)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(entries = values.len(), path = ?self.path, "persisted transfer store");
        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.read().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.write().unwrap();
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.write().unwrap();
        if values.remove(key).is_none() {
            return Ok(());
        }
        self.persist(&values)
    }
}

fn load_values(path: &Path) -> Result<HashMap<String, String>, StoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let values: HashMap<String, String> = serde_json::from_str(&data)?;
    debug!(entries = values.len(), path = ?path, "loaded transfer store");
    Ok(values)
}

/// Key holding a single transfer's snapshot.
pub fn transfer_key(file_id: &str) -> String {
    format!("filetransfer:{file_id}")
}

/// Key holding a room's transfer list.
pub fn room_key(room_id: &str) -> String {
    format!("filetransfer:forRoom:{room_id}")
}

/// Persisted state of a peer receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverSnapshot {
    pub num_saved_chunks: u32,
    #[serde(default)]
    pub metadata: Option<FileMetadata>,
}

/// Persisted state of an HTTP sender.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSnapshot {
    pub num_uploaded_chunks: u32,
    #[serde(default)]
    pub upload_id: Option<String>,
}

/// One entry of a room's transfer list, tagged by role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransferSummary {
    #[serde(rename = "p2pReceiver", rename_all = "camelCase")]
    PeerReceiver {
        file_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid: Option<String>,
        status: TransferStatus,
    },
    #[serde(rename = "httpSender", rename_all = "camelCase")]
    HttpSender {
        file_id: String,
        status: TransferStatus,
    },
}

impl TransferSummary {
    pub fn file_id(&self) -> &str {
        match self {
            Self::PeerReceiver { file_id, .. } | Self::HttpSender { file_id, .. } => file_id,
        }
    }

    pub fn status(&self) -> TransferStatus {
        match self {
            Self::PeerReceiver { status, .. } | Self::HttpSender { status, .. } => *status,
        }
    }
}

/// Typed snapshot access on top of a [`StateStore`].
#[derive(Clone)]
pub struct TransferStore {
    inner: Arc<dyn StateStore>,
}

impl TransferStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self { inner }
    }

    /// Reads and decodes the value under `key`.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.inner.get(key)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Encodes `value` and replaces whatever was under `key`.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string(value)?;
        self.inner.set(key, &json)
    }

    pub fn load_receiver(&self, file_id: &str) -> Result<Option<ReceiverSnapshot>, StoreError> {
        self.load(&transfer_key(file_id))
    }

    pub fn save_receiver(&self, file_id: &str, snap: &ReceiverSnapshot) -> Result<(), StoreError> {
        self.save(&transfer_key(file_id), snap)
    }

    pub fn load_upload(&self, file_id: &str) -> Result<Option<UploadSnapshot>, StoreError> {
        self.load(&transfer_key(file_id))
    }

    pub fn save_upload(&self, file_id: &str, snap: &UploadSnapshot) -> Result<(), StoreError> {
        self.save(&transfer_key(file_id), snap)
    }

    /// Returns the room's transfer list, empty if none was saved.
    pub fn load_room(&self, room_id: &str) -> Result<Vec<TransferSummary>, StoreError> {
        Ok(self.load(&room_key(room_id))?.unwrap_or_default())
    }

    pub fn save_room(&self, room_id: &str, list: &[TransferSummary]) -> Result<(), StoreError> {
        self.save(&room_key(room_id), &list)
    }

    pub fn remove_transfer(&self, file_id: &str) -> Result<(), StoreError> {
        self.inner.remove(&transfer_key(file_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> TransferStore {
        TransferStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn key_shapes() {
        assert_eq!(transfer_key("abc"), "filetransfer:abc");
        assert_eq!(room_key("r1"), "filetransfer:forRoom:r1");
    }

    #[test]
    fn receiver_snapshot_round_trip() {
        let store = memory();
        let snap = ReceiverSnapshot {
            num_saved_chunks: 128,
            metadata: Some(FileMetadata {
                name: "guest.webm".into(),
                size: 2_713_600,
                mime_type: "video/webm".into(),
            }),
        };
        store.save_receiver("f1", &snap).unwrap();
        assert_eq!(store.load_receiver("f1").unwrap(), Some(snap));
        assert_eq!(store.load_receiver("f2").unwrap(), None);
    }

    #[test]
    fn upload_snapshot_wire_shape() {
        let json = serde_json::to_value(UploadSnapshot {
            num_uploaded_chunks: 5,
            upload_id: Some("X".into()),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"numUploadedChunks": 5, "uploadId": "X"})
        );
    }

    #[test]
    fn upload_snapshot_without_upload_id() {
        let snap: UploadSnapshot = serde_json::from_str(r#"{"numUploadedChunks":0}"#).unwrap();
        assert_eq!(snap.upload_id, None);
    }

    #[test]
    fn room_list_tagged_by_role() {
        let store = memory();
        let list = vec![
            TransferSummary::PeerReceiver {
                file_id: "a".into(),
                uid: Some("peer-1".into()),
                status: TransferStatus::Disconnected,
            },
            TransferSummary::HttpSender {
                file_id: "b".into(),
                status: TransferStatus::Completed,
            },
        ];
        store.save_room("room", &list).unwrap();

        let raw: serde_json::Value = store.load("filetransfer:forRoom:room").unwrap().unwrap();
        assert_eq!(raw[0]["type"], "p2pReceiver");
        assert_eq!(raw[0]["fileId"], "a");
        assert_eq!(raw[0]["uid"], "peer-1");
        assert_eq!(raw[1]["type"], "httpSender");
        assert_eq!(raw[1]["status"], "completed");

        assert_eq!(store.load_room("room").unwrap(), list);
        assert!(store.load_room("other").unwrap().is_empty());
    }

    #[test]
    fn corrupt_value_is_an_error() {
        let inner = Arc::new(MemoryStore::new());
        inner.set("filetransfer:x", "{not json").unwrap();
        let store = TransferStore::new(inner);
        assert!(matches!(
            store.load_receiver("x"),
            Err(StoreError::Json(_))
        ));
    }

    #[test]
    fn remove_transfer_clears_key() {
        let store = memory();
        store
            .save_upload("f", &UploadSnapshot::default())
            .unwrap();
        store.remove_transfer("f").unwrap();
        assert_eq!(store.load_upload("f").unwrap(), None);
    }

    #[test]
    fn json_file_store_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("transfers.json");

        {
            let store = JsonFileStore::open(&path).unwrap();
            store.set("filetransfer:a", r#"{"numSavedChunks":64}"#).unwrap();
            store.set("filetransfer:b", "1").unwrap();
            store.remove("filetransfer:b").unwrap();
        }

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("filetransfer:a").unwrap().as_deref(),
            Some(r#"{"numSavedChunks":64}"#)
        );
        assert_eq!(reopened.get("filetransfer:b").unwrap(), None);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn json_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("nope.json")).unwrap();
        assert_eq!(store.get("anything").unwrap(), None);
    }

    #[test]
    fn json_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "[1,2").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path),
            Err(StoreError::Json(_))
        ));
    }
}
