//! HTTP stage invoker.
//!
//! POSTs the payload as JSON to a function URL. `202 Accepted` and the usual
//! "come back later" statuses map to transient failures so a poll-style retry
//! policy can wait for long-running jobs.

use std::collections::HashMap;

use async_trait::async_trait;

use super::StageInvoker;
use crate::domain::{FailureKind, StageFailure, StagePayload, StageResult};

/// Stage invoker backed by an HTTP endpoint
pub struct HttpInvoker {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl HttpInvoker {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// Failure kind for a non-success status code
pub fn failure_kind_for_status(status: u16) -> FailureKind {
    match status {
        202 | 409 | 423 | 429 => FailureKind::Transient,
        500..=599 => FailureKind::Transient,
        _ => FailureKind::Permanent,
    }
}

#[async_trait]
impl StageInvoker for HttpInvoker {
    fn name(&self) -> &str {
        &self.url
    }

    async fn invoke(&self, payload: &StagePayload) -> StageResult {
        let mut request = self.client.post(&self.url).json(payload);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            StageFailure::transient(format!("Request to {} failed: {}", self.url, e))
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            StageFailure::transient(format!("Failed to read response from {}: {}", self.url, e))
        })?;

        if status.is_success() && status.as_u16() != 202 {
            if body.trim().is_empty() {
                return Ok(payload.clone());
            }
            return serde_json::from_str(&body).map_err(|e| {
                StageFailure::permanent(format!("{} returned invalid JSON: {}", self.url, e))
            });
        }

        let cause = if body.trim().is_empty() {
            format!("{} returned {}", self.url, status)
        } else {
            body.trim().to_string()
        };
        Err(StageFailure::new(failure_kind_for_status(status.as_u16()), cause))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(failure_kind_for_status(202), FailureKind::Transient);
        assert_eq!(failure_kind_for_status(429), FailureKind::Transient);
        assert_eq!(failure_kind_for_status(503), FailureKind::Transient);
        assert_eq!(failure_kind_for_status(400), FailureKind::Permanent);
        assert_eq!(failure_kind_for_status(404), FailureKind::Permanent);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        // Port 9 (discard) is closed on test machines
        let invoker = HttpInvoker::new("http://127.0.0.1:9/train");
        let failure = invoker.invoke(&serde_json::json!({})).await.unwrap_err();

        assert_eq!(failure.kind, FailureKind::Transient);
        assert!(failure.cause.contains("127.0.0.1:9"));
    }

    #[tokio::test]
    async fn test_truncated_body_is_transient() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Promises 100 bytes, sends a fragment, then hangs up
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n{\"model\"",
                )
                .await
                .unwrap();
        });

        let invoker = HttpInvoker::new(format!("http://{}/train", addr));
        let failure = invoker
            .invoke(&serde_json::json!({"job_name": "job-1"}))
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::Transient);
    }
}
