//! HTTP client for the relay daemon.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use genrelay_core::api::{
    ActiveResponse, ErrorBody, GenerateRequest, GenerateResponse, StatusResponse, StopRequest,
    StopResponse,
};
use reqwest::StatusCode;
use thiserror::Error;
use tokio_stream::{Stream, StreamExt};

use crate::sse::{SseDecoder, SseFrame};

/// Default daemon address.
pub const DEFAULT_URL: &str = "http://127.0.0.1:8765";

/// Relay client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Relay error ({status}, {code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stream lost after {attempts} reconnect attempts")]
    GaveUp { attempts: u32 },
}

impl ClientError {
    /// A 409 from the relay: the session already runs a generation.
    pub fn is_lock_busy(&self) -> bool {
        matches!(self, Self::Api { status: 409, .. })
    }
}

/// SSE messages of one stream connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SseFrame, ClientError>> + Send>>;

/// The relay operations a follower needs.
#[async_trait]
pub trait RelayApi: Send + Sync {
    async fn open_stream(
        &self,
        response_id: &str,
        start_from: u64,
        epoch: Option<u64>,
    ) -> Result<FrameStream, ClientError>;

    async fn active(&self, session_id: &str) -> Result<ActiveResponse, ClientError>;

    async fn status(&self, response_id: &str) -> Result<Option<StatusResponse>, ClientError>;
}

#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ClientError::Config("relay URL is empty".into()));
        }

        // reqwest uses rustls-no-provider; Err means a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Turn a non-success response into [`ClientError::Api`], reading the
    /// relay's `{error, code}` body when there is one.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.code, body.error),
            Err(_) => (
                "http".to_string(),
                status.canonical_reason().unwrap_or("Unknown").to_string(),
            ),
        };
        Err(ClientError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }

    pub async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, ClientError> {
        let resp = self
            .http
            .post(self.url("/generate"))
            .json(request)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn stop(&self, request: &StopRequest) -> Result<StopResponse, ClientError> {
        let resp = self.http.post(self.url("/stop")).json(request).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Active responses of every session.
    pub async fn active_all(&self) -> Result<ActiveResponse, ClientError> {
        let resp = self.http.get(self.url("/active")).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }
}

#[async_trait]
impl RelayApi for RelayClient {
    async fn open_stream(
        &self,
        response_id: &str,
        start_from: u64,
        epoch: Option<u64>,
    ) -> Result<FrameStream, ClientError> {
        let mut query = vec![
            ("id", response_id.to_string()),
            ("start_from", start_from.to_string()),
        ];
        if let Some(epoch) = epoch {
            query.push(("epoch", epoch.to_string()));
        }
        let url = reqwest::Url::parse_with_params(&self.url("/stream"), &query)
            .map_err(|e| ClientError::Config(e.to_string()))?;
        let resp = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let bytes = Self::check(resp).await?.bytes_stream();

        let frames = async_stream::stream! {
            let mut bytes = std::pin::pin!(bytes);
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        for frame in decoder.push(&chunk) {
                            yield Ok(frame);
                        }
                    }
                    Err(e) => {
                        yield Err(ClientError::Http(e));
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(frames))
    }

    async fn active(&self, session_id: &str) -> Result<ActiveResponse, ClientError> {
        let url = reqwest::Url::parse_with_params(&self.url("/active"), [("session_id", session_id)])
            .map_err(|e| ClientError::Config(e.to_string()))?;
        let resp = self.http.get(url).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn status(&self, response_id: &str) -> Result<Option<StatusResponse>, ClientError> {
        let resp = self
            .http
            .get(self.url(&format!("/status/{response_id}")))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::check(resp).await?.json().await?))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = RelayClient::new("http://127.0.0.1:8765/ ").unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:8765");
        assert_eq!(client.url("/health"), "http://127.0.0.1:8765/health");
    }

    #[test]
    fn empty_url_is_rejected() {
        assert!(matches!(
            RelayClient::new("  "),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn lock_busy_is_recognized() {
        let err = ClientError::Api {
            status: 409,
            code: "lock_busy".into(),
            message: "busy".into(),
        };
        assert!(err.is_lock_busy());
        assert!(!ClientError::Config("x".into()).is_lock_busy());
    }
}
