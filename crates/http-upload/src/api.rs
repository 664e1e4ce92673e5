//! Upload server capability.

use fireside_transfer::BoxFuture;
use serde::Deserialize;

/// Errors from upload server calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The request failed before any response arrived.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Transport failures are worth retrying; everything else is final.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Server side of a chunked upload session.
pub trait UploadApi: Send + Sync {
    /// Opens a session for `file_id` and returns its upload id.
    fn initiate<'a>(&'a self, file_id: &'a str) -> BoxFuture<'a, Result<String, ApiError>>;

    /// Returns the one-time URL chunk `index` must be PUT to.
    fn chunk_url<'a>(
        &'a self,
        file_id: &'a str,
        upload_id: &'a str,
        index: u32,
    ) -> BoxFuture<'a, Result<String, ApiError>>;

    fn put_chunk<'a>(&'a self, url: &'a str, data: &'a [u8]) -> BoxFuture<'a, Result<(), ApiError>>;

    /// Finishes the session; returns the uploaded file's URL if the server
    /// reports one.
    fn complete<'a>(
        &'a self,
        file_id: &'a str,
        upload_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, ApiError>>;

    fn abort<'a>(&'a self, file_id: &'a str, upload_id: &'a str) -> BoxFuture<'a, Result<(), ApiError>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitiateResponse {
    pub upload_id: String,
}

/// Chunk URL body: `{"url": "..."}` or a bare JSON string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum UrlResponse {
    Object { url: String },
    Bare(String),
}

impl UrlResponse {
    pub fn into_url(self) -> String {
        match self {
            Self::Object { url } | Self::Bare(url) => url,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CompleteResponse {
    #[serde(default)]
    pub url: Option<String>,
}
