use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use url::Url;

use crate::common::error::ApiError;
use crate::common::models::{AttachmentUpload, ThreadId, WireMessage};
use crate::common::protocol::*;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const UPLOAD_CHUNK: usize = 64 * 1024;

/// REST surface the sync engine talks to.
#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn list_messages(&self, thread_id: ThreadId, query: &ListQuery) -> Result<MessagePage, ApiError>;

    /// Creates a message; the server dedupes on `client_request_id`.
    async fn send_message(&self, thread_id: ThreadId, request: &SendMessageRequest) -> Result<WireMessage, ApiError>;

    async fn add_reaction(&self, message_id: i64, emoji: &str) -> Result<(), ApiError>;

    async fn remove_reaction(&self, message_id: i64, emoji: &str) -> Result<(), ApiError>;

    async fn delete_message(&self, message_id: i64) -> Result<(), ApiError>;

    async fn mark_delivered(&self, thread_id: ThreadId, up_to_id: i64) -> Result<(), ApiError>;

    async fn init_attachment(
        &self,
        thread_id: ThreadId,
        request: &AttachmentInitRequest,
    ) -> Result<AttachmentInit, ApiError>;

    /// Uploads the bytes, reporting whole-percent progress as it goes.
    async fn upload_attachment(
        &self,
        target: &UploadTarget,
        upload: &AttachmentUpload,
        progress: mpsc::UnboundedSender<u8>,
    ) -> Result<(), ApiError>;

    async fn finalize_attachment(
        &self,
        message_id: i64,
        request: &AttachmentFinalizeRequest,
    ) -> Result<WireMessage, ApiError>;
}

pub struct HttpMessageApi {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpMessageApi {
    pub fn new(base_url: &str, token: Option<String>) -> anyhow::Result<Self> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            anyhow::bail!("API base URL {} cannot carry paths", base_url);
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, base, token })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::Decode("base URL cannot carry paths".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = self.authorized(request).send().await.map_err(transport_error)?;
        check_status(response).await
    }

    async fn execute_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = self.execute(request).await?;
        response.json::<T>().await.map_err(|e| ApiError::Decode(e.to_string()))
    }
}

fn transport_error(error: reqwest::Error) -> ApiError {
    if error.is_timeout() {
        ApiError::Timeout
    } else if error.is_decode() {
        ApiError::Decode(error.to_string())
    } else {
        ApiError::Network(error.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    let message = response.text().await.unwrap_or_default();
    debug!("[API] Request failed with {}: {}", code, message);
    Err(match code {
        404 => ApiError::NotFound,
        401 | 403 => ApiError::Forbidden(code),
        _ => ApiError::Status { status: code, message },
    })
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn list_messages(&self, thread_id: ThreadId, query: &ListQuery) -> Result<MessagePage, ApiError> {
        let url = self.endpoint(&["threads", &thread_id.to_string(), "messages"])?;
        debug!("[API] GET {} {:?}", url, query);
        self.execute_json(self.client.get(url).query(&query.to_pairs())).await
    }

    async fn send_message(&self, thread_id: ThreadId, request: &SendMessageRequest) -> Result<WireMessage, ApiError> {
        let url = self.endpoint(&["threads", &thread_id.to_string(), "messages"])?;
        debug!("[API] POST {} (request {})", url, request.client_request_id);
        let builder = self
            .client
            .post(url)
            .header("Idempotency-Key", request.client_request_id.as_str())
            .json(request);
        self.execute_json(builder).await
    }

    async fn add_reaction(&self, message_id: i64, emoji: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["messages", &message_id.to_string(), "reactions"])?;
        let body = serde_json::json!({ "emoji": emoji });
        self.execute(self.client.post(url).json(&body)).await.map(|_| ())
    }

    async fn remove_reaction(&self, message_id: i64, emoji: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["messages", &message_id.to_string(), "reactions", emoji])?;
        self.execute(self.client.delete(url)).await.map(|_| ())
    }

    async fn delete_message(&self, message_id: i64) -> Result<(), ApiError> {
        let url = self.endpoint(&["messages", &message_id.to_string()])?;
        self.execute(self.client.delete(url)).await.map(|_| ())
    }

    async fn mark_delivered(&self, thread_id: ThreadId, up_to_id: i64) -> Result<(), ApiError> {
        let url = self.endpoint(&["threads", &thread_id.to_string(), "messages", "delivered"])?;
        let body = serde_json::json!({ "up_to_id": up_to_id });
        self.execute(self.client.put(url).json(&body)).await.map(|_| ())
    }

    async fn init_attachment(
        &self,
        thread_id: ThreadId,
        request: &AttachmentInitRequest,
    ) -> Result<AttachmentInit, ApiError> {
        let url = self.endpoint(&["threads", &thread_id.to_string(), "attachments", "init"])?;
        let builder = self
            .client
            .post(url)
            .header("Idempotency-Key", request.client_request_id.as_str())
            .json(request);
        self.execute_json(builder).await
    }

    async fn upload_attachment(
        &self,
        target: &UploadTarget,
        upload: &AttachmentUpload,
        progress: mpsc::UnboundedSender<u8>,
    ) -> Result<(), ApiError> {
        let total = upload.bytes.len();
        let chunks: Vec<Vec<u8>> = upload.bytes.chunks(UPLOAD_CHUNK).map(|c| c.to_vec()).collect();
        let mut sent = 0usize;
        let stream = futures_util::stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len();
            let percent = if total == 0 { 100 } else { (sent * 100 / total) as u8 };
            let _ = progress.send(percent);
            Ok::<_, std::io::Error>(chunk)
        }));

        let mut builder = self
            .client
            .put(target.upload_url.as_str())
            .header(reqwest::header::CONTENT_TYPE, upload.content_type.as_str())
            .header(reqwest::header::CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(stream));
        for (name, value) in &target.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        debug!("[API] PUT {} ({} bytes)", target.upload_url, total);
        // Storage targets are pre-signed; no bearer token.
        let response = builder.send().await.map_err(transport_error)?;
        check_status(response).await.map(|_| ())
    }

    async fn finalize_attachment(
        &self,
        message_id: i64,
        request: &AttachmentFinalizeRequest,
    ) -> Result<WireMessage, ApiError> {
        let url = self.endpoint(&["messages", &message_id.to_string(), "attachment", "finalize"])?;
        self.execute_json(self.client.post(url).json(request)).await
    }
}
