//! Fire-and-forget run events.

use crate::error::NotifyError;
use crate::metrics;
use crate::worker::ProgressSnapshot;
use async_trait::async_trait;
use bottlesync_core::config::NotificationConfig;
use bottlesync_core::{OutcomeCounts, RunPhase};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Event delivered to every sink.
#[derive(Clone, Debug, Serialize)]
pub struct SyncEvent {
    pub phase: RunPhase,
    /// `RUNNING` while downloading, then the terminal state.
    pub status: String,
    pub counts: OutcomeCounts,
    pub duration_ms: u64,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressSnapshot>,
}

/// Destination for run events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, event: &SyncEvent) -> Result<(), NotifyError>;
}

/// Writes events to the log. Always installed.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn deliver(&self, event: &SyncEvent) -> Result<(), NotifyError> {
        tracing::info!(
            phase = event.phase.as_str(),
            status = %event.status,
            uploaded = event.counts.uploaded,
            failed = event.counts.failed,
            skipped = event.counts.skipped,
            duration_ms = event.duration_ms,
            errors = event.errors.len(),
            "sync event"
        );
        Ok(())
    }
}

/// POSTs events as JSON to an HTTPS endpoint.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Result<Self, NotifyError> {
        let url = url.into();
        if !url.to_ascii_lowercase().starts_with("https://") {
            return Err(NotifyError::Request(format!("webhook must use https: {url}")));
        }
        Ok(Self { client, url })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, event: &SyncEvent) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Fans events out to every sink. Delivery never fails the caller.
#[derive(Clone)]
pub struct Notifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>, timeout: Duration) -> Self {
        Self { sinks, timeout }
    }

    /// Tracing sink plus the configured webhook, if any.
    pub fn from_config(config: &NotificationConfig, client: reqwest::Client) -> Result<Self, NotifyError> {
        let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(TracingSink)];
        if let Some(url) = &config.webhook_url {
            sinks.push(Arc::new(WebhookSink::new(client, url.clone())?));
        }
        Ok(Self::new(sinks, config.timeout()))
    }

    /// Add a sink.
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub async fn emit(&self, event: &SyncEvent) {
        for sink in &self.sinks {
            let result = match tokio::time::timeout(self.timeout, sink.deliver(event)).await {
                Ok(result) => result,
                Err(_) => Err(NotifyError::Timeout(self.timeout)),
            };
            if let Err(e) = result {
                metrics::NOTIFICATION_FAILURES
                    .with_label_values(&[sink.name()])
                    .inc();
                tracing::warn!(sink = sink.name(), error = %e, "notification delivery failed");
            }
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(vec![Arc::new(TracingSink)], Duration::from_secs(10))
    }
}
