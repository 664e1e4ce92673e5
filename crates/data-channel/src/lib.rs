//! Resumable file transfer over an ordered, reliable peer data channel.
//!
//! The receiver drives the exchange: it asks for metadata, then requests one
//! block of chunks at a time starting at the first chunk it has not durably
//! stored. The sender answers each request by streaming the block's chunks as
//! binary frames (see [`fireside_protocol::codec`]).
//!
//! ```text
//! receiver                       sender
//!    | -- requestMetadata -------> |
//!    | <------------- metadata --- |
//!    | -- requestChunks{k} ------> |
//!    | <--- chunk k .. k+63 ------ |
//!    |   (append block, persist)   |
//!    | -- requestChunks{k+64} ---> |
//! ```

pub mod channel;
pub mod error;
pub mod memory;
pub mod receiver;
pub mod sender;

pub use channel::{ChannelEndpoint, ChannelEvent, ChannelMessage, DataChannel, ReadyState};
pub use error::DataChannelError;
pub use memory::{MemoryChannel, MemoryEnd, memory_pair};
pub use receiver::{PeerReceiver, ReceiverContext};
pub use sender::PeerSender;

use fireside_protocol::{CHUNK_SIZE, CHUNKS_PER_BLOCK};
use serde::{Deserialize, Deserializer};

/// Prefix of every data channel label used for file transfers.
pub const LABEL_PREFIX: &str = "filetransfer:";

/// Storage path of a received file.
pub fn transfer_path(file_id: &str) -> String {
    format!("transfers/{file_id}")
}

/// Chunking parameters shared by both ends of a peer transfer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PeerTransferConfig {
    /// Payload bytes per chunk.
    #[serde(deserialize_with = "non_zero")]
    pub chunk_size: u64,
    /// Chunks requested and flushed together.
    #[serde(deserialize_with = "non_zero")]
    pub chunks_per_block: u32,
    /// Prefetched blocks a sender keeps.
    pub block_cache_size: usize,
}

impl Default for PeerTransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            chunks_per_block: CHUNKS_PER_BLOCK,
            block_cache_size: 4,
        }
    }
}

fn non_zero<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default + PartialEq,
{
    let value = T::deserialize(deserializer)?;
    if value == T::default() {
        return Err(serde::de::Error::custom("must be greater than zero"));
    }
    Ok(value)
}
