//! Audit notifications.
//!
//! Delivery is best effort: callers log a failed notification and carry
//! on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;
use vpsforge_common::config::ForgeConfig;
use vpsforge_common::error::{ForgeError, Result};
use vpsforge_common::types::{ContainerId, ContainerRecord, NatRule, OwnerId};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A container was deleted by its owner.
    Deleted,
    /// A failed container was reclaimed after its grace period.
    Reclaimed,
}

/// A lifecycle event worth telling an operator about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    /// Unique event id.
    pub event_id: Uuid,
    /// Event kind.
    pub kind: AuditKind,
    /// Container concerned.
    pub container: ContainerId,
    /// Its display name.
    pub name: String,
    /// Its owner.
    pub owner: OwnerId,
    /// Forward that was revoked, if any.
    pub forward: NatRule,
    /// When it happened.
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    /// Builds an event about `record`.
    #[must_use]
    pub fn new(kind: AuditKind, record: &ContainerRecord, at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            container: record.id,
            name: record.name.clone(),
            owner: record.owner.clone(),
            forward: record.ssh_rule(),
            at,
        }
    }

    /// One-line human readable text.
    #[must_use]
    pub fn message(&self) -> String {
        let verb = match self.kind {
            AuditKind::Deleted => "deleted",
            AuditKind::Reclaimed => "reclaimed",
        };
        format!(
            "Container {} ({}) owned by {} was {verb} at {}; port {} released.",
            self.name,
            self.container,
            self.owner,
            self.at.to_rfc3339(),
            self.forward.external_port
        )
    }
}

/// Destination of audit events.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers `event`.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails.
    async fn notify(&self, event: &AuditEvent) -> Result<()>;
}

/// Drops events after logging them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &AuditEvent) -> Result<()> {
        tracing::info!(id = %event.container, kind = ?event.kind, "{}", event.message());
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    content: String,
    event: &'a AuditEvent,
}

/// Posts events as `{"content": ..., "event": ...}` JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Creates a notifier posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ForgeError::Config {
                message: format!("cannot build webhook client: {e}"),
            })?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &AuditEvent) -> Result<()> {
        let body = WebhookBody {
            content: event.message(),
            event,
        };
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ForgeError::external("audit webhook", e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ForgeError::external(
                "audit webhook",
                format!("HTTP {status}"),
            ));
        }
        tracing::debug!(event = %event.event_id, "audit event delivered");
        Ok(())
    }
}

/// Picks the webhook when configured, the log otherwise.
///
/// # Errors
///
/// Returns an error if the webhook client cannot be built.
pub fn from_config(config: &ForgeConfig) -> Result<Arc<dyn Notifier>> {
    match &config.notify.webhook_url {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(
            url.clone(),
            config.timeouts.command(),
        )?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}

/// Sends `event`, logging instead of failing.
pub(crate) async fn deliver(notifier: &dyn Notifier, event: &AuditEvent) {
    if let Err(e) = notifier.notify(event).await {
        tracing::warn!(id = %event.container, error = %e, "audit notification failed");
    }
}
