use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("Probe request failed: {0}")]
    Request(String),

    #[error("Probe returned HTTP {0}")]
    Status(u16),
}

/// Measures one round trip to the backend
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self) -> Result<Duration, ProbeError>;
}

pub struct HttpProber {
    http_client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(http_client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http_client,
            url: url.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        let response = self
            .http_client
            .head(&self.url)
            .header("Cache-Control", "no-cache")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout(self.timeout)
                } else {
                    ProbeError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        Ok(started.elapsed())
    }
}
