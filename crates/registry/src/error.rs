//! Registry error types.

use fireside_data_channel::DataChannelError;
use fireside_http_upload::UploadError;
use fireside_transfer::{StoreError, TransferError};

/// Errors produced by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no transfer for file {0}")]
    NotFound(String),

    #[error("source file for {0} is not available")]
    MissingFile(String),

    #[error("data channel error: {0}")]
    DataChannel(#[from] DataChannelError),

    #[error("upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("file error: {0}")]
    File(#[from] TransferError),
}
