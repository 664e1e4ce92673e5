use serde::{Deserialize, Serialize};

/// File metadata announced by a peer sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
}

/// Lifecycle status shared by every transfer role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    /// No live channel or upload loop; resumable.
    #[default]
    Disconnected,
    /// Chunks are moving.
    InProgress,
    /// Every chunk is durably stored. Terminal.
    Completed,
}

impl TransferStatus {
    /// Returns `true` for the terminal state.
    pub fn is_complete(self) -> bool {
        self == Self::Completed
    }

    /// Status written to a room snapshot.
    ///
    /// Nothing is in progress after a reload, so only completion survives.
    pub fn persisted(self) -> Self {
        match self {
            Self::Completed => Self::Completed,
            _ => Self::Disconnected,
        }
    }
}

/// Number of chunks needed for `size` bytes, i.e. `ceil(size / chunk_size)`.
///
/// Returns 0 when `chunk_size` is 0.
pub fn num_chunks(size: u64, chunk_size: u64) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    u32::try_from(size.div_ceil(chunk_size)).unwrap_or(u32::MAX)
}

/// Byte offset of chunk `index`.
pub fn chunk_offset(index: u32, chunk_size: u64) -> u64 {
    u64::from(index) * chunk_size
}

/// Length of chunk `index`; the last chunk may be short, chunks past the end
/// are empty.
pub fn chunk_len(index: u32, size: u64, chunk_size: u64) -> u64 {
    let offset = chunk_offset(index, chunk_size);
    size.saturating_sub(offset).min(chunk_size)
}
