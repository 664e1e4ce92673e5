//! `reqwest` implementation of [`UploadApi`].

use fireside_transfer::BoxFuture;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::api::{ApiError, CompleteResponse, InitiateResponse, UploadApi, UrlResponse};

/// Where upload endpoints live.
///
/// With a room configured every path is prefixed by `/rooms/{roomId}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEndpoints {
    pub base_url: String,
    #[serde(default)]
    pub room_id: Option<String>,
}

impl UploadEndpoints {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            room_id: None,
        }
    }

    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    fn uploads(&self, file_id: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        match &self.room_id {
            Some(room) => format!("{base}/rooms/{room}/uploads/{file_id}/"),
            None => format!("{base}/uploads/{file_id}/"),
        }
    }

    pub fn initiate_url(&self, file_id: &str) -> String {
        self.uploads(file_id)
    }

    pub fn chunk_url(&self, file_id: &str, upload_id: &str, index: u32) -> String {
        format!("{}{upload_id}/chunks/{index}/", self.uploads(file_id))
    }

    pub fn complete_url(&self, file_id: &str, upload_id: &str) -> String {
        format!("{}{upload_id}/complete/", self.uploads(file_id))
    }

    pub fn abort_url(&self, file_id: &str, upload_id: &str) -> String {
        format!("{}{upload_id}/abort/", self.uploads(file_id))
    }
}

/// Upload API client.
pub struct ReqwestUploadApi {
    http: reqwest::Client,
    endpoints: UploadEndpoints,
}

impl ReqwestUploadApi {
    pub fn new(endpoints: UploadEndpoints) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().build().map_err(transport)?;
        Ok(Self::with_client(http, endpoints))
    }

    /// Uses an existing client, e.g. one carrying auth headers.
    pub fn with_client(http: reqwest::Client, endpoints: UploadEndpoints) -> Self {
        Self { http, endpoints }
    }

    pub fn endpoints(&self) -> &UploadEndpoints {
        &self.endpoints
    }

    /// POSTs to `url` and returns the body of a successful response.
    async fn post(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        trace!(%url, "POST");
        let resp = self.http.post(url).send().await.map_err(transport)?;
        read_body(resp).await
    }

    async fn post_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ApiError> {
        let body = self.post(url).await?;
        serde_json::from_slice(&body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    async fn do_initiate(&self, file_id: &str) -> Result<String, ApiError> {
        let resp: InitiateResponse = self
            .post_json(&self.endpoints.initiate_url(file_id))
            .await?;
        debug!(file_id, upload_id = %resp.upload_id, "upload session opened");
        Ok(resp.upload_id)
    }

    async fn do_chunk_url(
        &self,
        file_id: &str,
        upload_id: &str,
        index: u32,
    ) -> Result<String, ApiError> {
        let resp: UrlResponse = self
            .post_json(&self.endpoints.chunk_url(file_id, upload_id, index))
            .await?;
        Ok(resp.into_url())
    }

    async fn do_put_chunk(&self, url: &str, data: &[u8]) -> Result<(), ApiError> {
        trace!(%url, len = data.len(), "PUT");
        let resp = self
            .http
            .put(url)
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            )
            .body(data.to_vec())
            .send()
            .await
            .map_err(transport)?;
        read_body(resp).await.map(drop)
    }

    async fn do_complete(&self, file_id: &str, upload_id: &str) -> Result<Option<String>, ApiError> {
        let body = self
            .post(&self.endpoints.complete_url(file_id, upload_id))
            .await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let resp: CompleteResponse = serde_json::from_slice(&body)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        Ok(resp.url)
    }

    async fn do_abort(&self, file_id: &str, upload_id: &str) -> Result<(), ApiError> {
        self.post(&self.endpoints.abort_url(file_id, upload_id))
            .await
            .map(drop)
    }
}

impl UploadApi for ReqwestUploadApi {
    fn initiate<'a>(&'a self, file_id: &'a str) -> BoxFuture<'a, Result<String, ApiError>> {
        Box::pin(self.do_initiate(file_id))
    }

    fn chunk_url<'a>(
        &'a self,
        file_id: &'a str,
        upload_id: &'a str,
        index: u32,
    ) -> BoxFuture<'a, Result<String, ApiError>> {
        Box::pin(self.do_chunk_url(file_id, upload_id, index))
    }

    fn put_chunk<'a>(&'a self, url: &'a str, data: &'a [u8]) -> BoxFuture<'a, Result<(), ApiError>> {
        Box::pin(self.do_put_chunk(url, data))
    }

    fn complete<'a>(
        &'a self,
        file_id: &'a str,
        upload_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, ApiError>> {
        Box::pin(self.do_complete(file_id, upload_id))
    }

    fn abort<'a>(&'a self, file_id: &'a str, upload_id: &'a str) -> BoxFuture<'a, Result<(), ApiError>> {
        Box::pin(self.do_abort(file_id, upload_id))
    }
}

fn transport(e: reqwest::Error) -> ApiError {
    // A request that cannot be built, such as a malformed chunk URL from the
    // server, fails the same way on every retry.
    if e.is_builder() {
        return ApiError::InvalidResponse(e.to_string());
    }
    ApiError::Transport(e.to_string())
}

async fn read_body(resp: reqwest::Response) -> Result<Vec<u8>, ApiError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ApiError::Server {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp.bytes().await.map_err(transport)?.to_vec())
}
