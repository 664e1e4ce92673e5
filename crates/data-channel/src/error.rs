//! Error types for peer transfers.

use fireside_protocol::ProtocolError;
use fireside_transfer::{StoreError, TransferError};

/// Errors produced by peer senders and receivers.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("data channel is closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("file error: {0}")]
    File(#[from] TransferError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("metadata mismatch: expected {expected} bytes, peer announced {actual}")]
    MetadataMismatch { expected: u64, actual: u64 },
}
