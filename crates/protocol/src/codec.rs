//! Binary chunk frame.
//!
//! # Wire format
//!
//! ```text
//! [4 bytes BE: chunk index]
//! [N bytes:    chunk payload]
//! ```
//!
//! One frame is sent per data-channel message, so the payload length is
//! implied by the message length.

use crate::ProtocolError;

/// Length of the chunk index header.
pub const CHUNK_HEADER_LEN: usize = 4;

/// Frames a chunk as `index || payload`.
pub fn encode_chunk(index: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(CHUNK_HEADER_LEN + payload.len());
    frame.extend_from_slice(&index.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Splits a frame into its chunk index and payload.
pub fn decode_chunk(frame: &[u8]) -> Result<(u32, &[u8]), ProtocolError> {
    if frame.len() < CHUNK_HEADER_LEN {
        return Err(ProtocolError::ShortFrame(frame.len()));
    }
    let (header, payload) = frame.split_at(CHUNK_HEADER_LEN);
    let index = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    Ok((index, payload))
}
