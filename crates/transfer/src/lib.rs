//! Building blocks shared by every Fireside transfer role.
//!
//! - [`BitrateTracker`]: rolling-window throughput estimate.
//! - [`spawn_ticker`]: periodic tick used to refresh the estimate.
//! - [`EventBus`]: publish/subscribe contract exposed by each role.
//! - [`store`]: key/value snapshots used to resume after a reload.
//! - [`file`]: file-handle capabilities consumed by senders and receivers.

mod bitrate;
pub mod events;
pub mod file;
pub mod store;
mod ticker;
mod validation;

use std::future::Future;
use std::pin::Pin;

pub use bitrate::{BitrateConfig, BitrateTracker};
pub use events::{EventBus, EventKind, Subscribe, SubscriptionId, TransferEvent};
pub use file::{
    FileHandle, FileSource, FileStorage, LocalFile, LocalFileStorage, MemoryFile,
    MemoryFileStorage,
};
pub use store::{
    JsonFileStore, MemoryStore, ReceiverSnapshot, StateStore, StoreError, TransferStore,
    TransferSummary, UploadSnapshot,
};
pub use ticker::{TickHandle, spawn_ticker};
pub use validation::validate_storage_path;

/// A boxed future returned by capability trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors produced by file handles and snapshot persistence.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("short read at offset {offset}: wanted {expected} bytes, got {actual}")]
    ShortRead {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
