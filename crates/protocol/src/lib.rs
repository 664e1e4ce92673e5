//! Wire types for the Fireside file-transfer engine.
//!
//! Covers the JSON control messages exchanged over a peer data channel,
//! the binary chunk frame, and the chunk arithmetic shared by every
//! transfer role.

pub mod codec;
pub mod messages;
pub mod types;

pub use codec::{CHUNK_HEADER_LEN, decode_chunk, encode_chunk};
pub use messages::ControlMessage;
pub use types::{FileMetadata, TransferStatus, chunk_len, chunk_offset, num_chunks};

/// Peer-channel chunk size in bytes.
///
/// Kept small enough to fit in a single SCTP message on every browser
/// data-channel implementation.
pub const CHUNK_SIZE: u64 = 16_000;

/// Number of chunks requested, buffered and flushed together by a peer
/// receiver.
pub const CHUNKS_PER_BLOCK: u32 = 64;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("chunk frame too short: {0} bytes")]
    ShortFrame(usize),
}
