//! HTTP transport for the stream consumer

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use crate::error::ConsumerError;
use crate::protocol::{PermissionDecision, StartRequest};

/// Raw body chunks of an open stream
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ConsumerError>> + Send>>;

/// Server calls the consumer depends on
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Issue a stream-start request and return the response body.
    async fn open(&self, session_id: &str, request: &StartRequest)
        -> Result<ByteStream, ConsumerError>;

    /// Post a permission decision.
    async fn decide(
        &self,
        session_id: &str,
        decision: &PermissionDecision,
    ) -> Result<(), ConsumerError>;

    /// Ask the server to cancel the session's live turn.
    async fn cancel(&self, session_id: &str) -> Result<bool, ConsumerError>;
}

/// `reqwest`-backed transport talking to a `tether serve` instance
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    http: Client,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct CancelBody {
    cancelled: bool,
}

impl HttpTransport {
    /// Create a transport for the server at `base_url`.
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    /// Base URL without trailing slash
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_url(&self, session_id: &str, suffix: &str) -> String {
        format!("{}/api/v1/sessions/{session_id}{suffix}", self.base_url)
    }
}

fn transport_error(e: &reqwest::Error) -> ConsumerError {
    ConsumerError::Transport(e.to_string())
}

/// Map a non-success response onto the consumer's error taxonomy.
///
/// 429 carries the server's wait hint; 409 and 5xx are transient; any
/// other status is a refusal the consumer must not retry.
async fn status_error(response: Response) -> ConsumerError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(Duration::from_secs(1), Duration::from_secs);

    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body
            .message
            .or(body.error)
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
        Err(_) => format!("HTTP {}", status.as_u16()),
    };

    if status == StatusCode::TOO_MANY_REQUESTS {
        ConsumerError::RateLimited { retry_after }
    } else if status == StatusCode::CONFLICT || status.is_server_error() {
        ConsumerError::Transport(format!("HTTP {}: {message}", status.as_u16()))
    } else {
        ConsumerError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(
        &self,
        session_id: &str,
        request: &StartRequest,
    ) -> Result<ByteStream, ConsumerError> {
        let response = self
            .http
            .post(self.session_url(session_id, "/stream"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| transport_error(&e)));
        Ok(Box::pin(body))
    }

    async fn decide(
        &self,
        session_id: &str,
        decision: &PermissionDecision,
    ) -> Result<(), ConsumerError> {
        let response = self
            .http
            .post(self.session_url(session_id, "/permissions"))
            .json(decision)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        if response.status().is_success() {
            Ok(())
        } else if response.status() == StatusCode::CONFLICT {
            Err(ConsumerError::Rejected {
                status: StatusCode::CONFLICT.as_u16(),
                message: format!("permission request {} is not pending", decision.id),
            })
        } else {
            Err(status_error(response).await)
        }
    }

    async fn cancel(&self, session_id: &str) -> Result<bool, ConsumerError> {
        let response = self
            .http
            .post(self.session_url(session_id, "/cancel"))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let body: CancelBody = response.json().await.map_err(|e| transport_error(&e))?;
        Ok(body.cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_trims_trailing_slash() {
        let transport = HttpTransport::new("http://localhost:8080/");
        assert_eq!(transport.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_session_urls() {
        let transport = HttpTransport::new("http://localhost:8080");
        assert_eq!(
            transport.session_url("s-1", "/stream"),
            "http://localhost:8080/api/v1/sessions/s-1/stream"
        );
        assert_eq!(
            transport.session_url("s-1", ""),
            "http://localhost:8080/api/v1/sessions/s-1"
        );
    }
}
