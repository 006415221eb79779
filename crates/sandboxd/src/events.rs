use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Timeout for webhook deliveries (shorter than any caller-facing timeout).
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Terminated,
    Failed,
}

/// Lifecycle notification for the surrounding application.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxEvent {
    pub event: EventKind,
    pub sandbox_id: Uuid,
    pub owner: String,
    pub at: DateTime<Utc>,
}

impl SandboxEvent {
    pub fn new(event: EventKind, sandbox_id: Uuid, owner: &str) -> Self {
        Self {
            event,
            sandbox_id,
            owner: owner.to_string(),
            at: Utc::now(),
        }
    }
}

/// Sink for lifecycle events. Delivery is best-effort; a broken sink must
/// never block or fail a lifecycle operation.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: SandboxEvent);
}

/// Default sink: structured log lines only.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, event: SandboxEvent) {
        info!(
            event = ?event.event,
            sandbox_id = %event.sandbox_id,
            owner = %event.owner,
            "lifecycle event"
        );
    }
}

/// Fire-and-forget webhook sink. The POST happens on a spawned task so a
/// slow receiver never sits on a lifecycle path.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn publish(&self, event: SandboxEvent) {
        let client = self.client.clone();
        let url = self.url.clone();

        tokio::spawn(async move {
            let result = client
                .post(&url)
                .timeout(WEBHOOK_TIMEOUT)
                .json(&event)
                .send()
                .await;

            match result {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(sandbox_id = %event.sandbox_id, status = %resp.status(), "event webhook rejected");
                }
                Err(e) => {
                    warn!(sandbox_id = %event.sandbox_id, error = %e, "event webhook failed");
                }
                _ => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_snake_case_kind() {
        let event = SandboxEvent::new(EventKind::Created, Uuid::nil(), "tenant-a");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "created");
        assert_eq!(json["owner"], "tenant-a");
        assert!(json.get("at").is_some());
    }

    #[tokio::test]
    async fn log_sink_accepts_events() {
        LogSink
            .publish(SandboxEvent::new(EventKind::Failed, Uuid::nil(), "t"))
            .await;
    }
}
