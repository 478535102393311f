//! Trigger sink: hands generated events to the downstream pipeline
//! executor. Delivery is at-least-once with the event identifier as the
//! deduplication key; the poll path records the outcome and leaves retries
//! to the sink's consumer.

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::time::Duration;
use thiserror::Error;

use crate::events::Event;
use crate::gitclient::api::SENTRY_USER_AGENT;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("webhook returned status {status}")]
    Status { status: u16 },

    #[error("failed to reach webhook: {0}")]
    Network(#[from] reqwest::Error),

    #[error("failed to build webhook client: {0}")]
    Build(String),
}

impl TriggerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TriggerError::Network(_) => true,
            TriggerError::Status { status } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            TriggerError::Build(_) => false,
        }
    }
}

#[async_trait]
pub trait TriggerSink: Send + Sync {
    /// Deliver one event. Terminal failures should not be re-sent.
    async fn send(&self, event: &Event) -> Result<(), TriggerError>;

    async fn health_check(&self) -> bool;

    async fn close(&self) {}
}

/// POSTs the event as JSON to a webhook URL.
pub struct HttpTrigger {
    http: reqwest::Client,
    url: String,
}

impl HttpTrigger {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TriggerError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(SENTRY_USER_AGENT));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TriggerError::Build(e.to_string()))?;

        Ok(HttpTrigger {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TriggerSink for HttpTrigger {
    async fn send(&self, event: &Event) -> Result<(), TriggerError> {
        let response = self.http.post(&self.url).json(event).send().await?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!(event_id = %event.id, kind = %event.kind.as_str(), "event dispatched");
            Ok(())
        } else {
            Err(TriggerError::Status {
                status: status.as_u16(),
            })
        }
    }

    /// A webhook endpoint may reject probes outright; any HTTP answer
    /// proves reachability.
    async fn health_check(&self) -> bool {
        self.http.head(&self.url).send().await.is_ok()
    }
}

/// Logs events instead of dispatching them; used in dry-run mode.
pub struct LogTrigger;

#[async_trait]
impl TriggerSink for LogTrigger {
    async fn send(&self, event: &Event) -> Result<(), TriggerError> {
        tracing::info!(
            event_id = %event.id,
            kind = %event.kind.as_str(),
            repository = %event.repository,
            branch = %event.branch,
            commit = %event.commit_sha,
            "dry-run: event not dispatched"
        );
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, EventStatus};
    use std::collections::BTreeMap;
    use time::OffsetDateTime;
    use wiremock::matchers::{body_json_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> Event {
        Event {
            id: "event_0011223344556677".to_string(),
            kind: EventKind::BranchUpdated,
            repository: "app".to_string(),
            branch: "main".to_string(),
            commit_sha: "sha_a2".to_string(),
            prev_commit: "sha_a".to_string(),
            provider: "github".to_string(),
            created_at: OffsetDateTime::from_unix_timestamp(1_717_243_200).unwrap(),
            status: EventStatus::Pending,
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_posts_event_as_json() {
        let server = MockServer::start().await;
        let expected = serde_json::to_string(&event()).unwrap();
        Mock::given(method("POST"))
            .and(path("/hooks/ci"))
            .and(body_json_string(expected))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sink =
            HttpTrigger::new(format!("{}/hooks/ci", server.uri()), Duration::from_secs(5)).unwrap();
        sink.send(&event()).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_errors_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let sink = HttpTrigger::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = sink.send(&event()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_client_errors_are_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let sink = HttpTrigger::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = sink.send(&event()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_log_trigger_always_accepts() {
        let sink = LogTrigger;
        assert!(sink.send(&event()).await.is_ok());
        assert!(sink.health_check().await);
    }
}
