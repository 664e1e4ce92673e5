//! Resumable upload of a file to an HTTP server, one chunk at a time.
//!
//! The server hands out a one-time URL per chunk; the sender PUTs the bytes
//! there and advances only on success. Transport failures are retried
//! forever with capped exponential backoff; anything else ends the upload.

pub mod api;
pub mod backoff;
pub mod client;
pub mod sender;

pub use api::{ApiError, UploadApi};
pub use backoff::{RetryBackoff, RetryConfig};
pub use client::{ReqwestUploadApi, UploadEndpoints};
pub use sender::{
    HttpSender, MAX_CHUNKS, MIN_CHUNK_SIZE, UploadContext, UploadError, http_chunk_size,
};
