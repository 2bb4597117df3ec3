use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CACHE_CONTROL};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StreamError};

/// Bytes of a non-2xx response body kept for the error
const ERROR_BODY_LIMIT: usize = 4 * 1024;

/// Raw chunks of one open connection, in arrival order
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Everything needed to open one stream connection
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub endpoint: String,
    pub method: Method,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
}

impl StreamRequest {
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: Method::Get,
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn post(endpoint: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: Method::Post,
            body: Some(body),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header(AUTHORIZATION.as_str(), format!("Bearer {}", token))
    }
}

/// Opens unidirectional, long-lived byte streams
///
/// Implementations must stop yielding (no chunks, no errors) once `cancel`
/// fires, and treat a non-2xx initial response as a hard failure.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, request: &StreamRequest, cancel: CancellationToken) -> Result<ChunkStream>;
}

/// HTTP transport (reqwest, response body as a byte stream)
pub struct HttpTransport {
    http_client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| StreamError::InvalidRequest(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: None,
        })
    }

    /// Use a preconfigured client (proxies, TLS roots, ...)
    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self {
            http_client,
            base_url: None,
        }
    }

    /// Resolve relative endpoints against this base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn resolve(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        match &self.base_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                endpoint.trim_start_matches('/')
            ),
            None => endpoint.to_string(),
        }
    }

    fn build(&self, request: &StreamRequest) -> Result<reqwest::RequestBuilder> {
        let url = self.resolve(&request.endpoint);
        let mut builder = match request.method {
            Method::Get => self.http_client.get(&url),
            Method::Post => self.http_client.post(&url),
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| StreamError::InvalidRequest(format!("Invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| StreamError::InvalidRequest(format!("Invalid header value: {}", e)))?;
            headers.insert(name, value);
        }
        builder = builder.headers(headers);

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder)
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(&self, request: &StreamRequest, cancel: CancellationToken) -> Result<ChunkStream> {
        let builder = self.build(request)?;
        tracing::debug!(endpoint = %request.endpoint, "Opening event stream");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            response = builder.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let chunks = response.bytes_stream().take_until(cancel.cancelled_owned());
            let body = body_excerpt(chunks, ERROR_BODY_LIMIT).await;
            return Err(StreamError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(StreamError::from))
            .take_until(cancel.cancelled_owned());

        Ok(Box::pin(chunks))
    }
}

/// Read at most `limit` bytes of a body, stopping at the first error
async fn body_excerpt<S, B, E>(chunks: S, limit: usize) -> String
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
{
    let mut chunks = std::pin::pin!(chunks);
    let mut body = Vec::new();
    while body.len() < limit {
        match chunks.next().await {
            Some(Ok(chunk)) => body.extend_from_slice(chunk.as_ref()),
            Some(Err(_)) | None => break,
        }
    }
    body.truncate(limit);
    String::from_utf8_lossy(&body).into_owned()
}
