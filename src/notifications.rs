//! Notifications for finished setup runs.
//!
//! A target is either a webhook (`webhook:<url>` or a bare URL), `desktop`
//! or `none`. Delivery failures are logged and never fail the run.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::process::Command;
use tracing::{debug, warn};

use crate::config::NotificationConfig;
use crate::pipeline::PipelineResult;

/// Which configured target to notify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NotificationEvent {
    /// Every selected repository was set up.
    Complete,
    /// At least one repository failed.
    Error,
}

impl NotificationEvent {
    fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    fn title(self) -> &'static str {
        match self {
            Self::Complete => "Burrow setup complete",
            Self::Error => "Burrow setup failed",
        }
    }
}

/// Parsed notification target.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Webhook(String),
    Desktop,
    None,
}

impl Target {
    fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Some(url) = value.strip_prefix("webhook:") {
            return (!url.is_empty()).then(|| Self::Webhook(url.to_string()));
        }
        match value {
            "desktop" => Some(Self::Desktop),
            "none" | "" => Some(Self::None),
            _ if value.starts_with("http://") || value.starts_with("https://") => {
                Some(Self::Webhook(value.to_string()))
            }
            _ => None,
        }
    }
}

/// Sends notifications based on configuration.
pub(crate) struct Notifier {
    config: NotificationConfig,
}

impl Notifier {
    pub fn new(config: NotificationConfig) -> Self {
        Self { config }
    }

    /// Sends the notification configured for `event`, if any.
    pub async fn notify(&self, event: NotificationEvent, details: &NotificationDetails) {
        let value = match event {
            NotificationEvent::Complete => self.config.on_complete.as_deref(),
            NotificationEvent::Error => self.config.on_error.as_deref(),
        };
        let Some(value) = value else {
            return;
        };

        match Target::parse(value) {
            Some(Target::Webhook(url)) => {
                if let Err(e) = send_webhook(&url, event, details).await {
                    warn!("Failed to send {} webhook: {}", event.as_str(), e);
                }
            }
            Some(Target::Desktop) => {
                if let Err(e) = send_desktop_notification(event.title(), &details.message) {
                    warn!("Failed to send desktop notification: {}", e);
                }
            }
            Some(Target::None) => {}
            None => warn!("Unknown notification target '{}'", value),
        }
    }

    /// Notifies `on_complete` or `on_error` depending on how the run ended.
    pub async fn notify_result(&self, result: &PipelineResult, sandbox: Option<&str>) {
        let (event, details) = if result.success {
            (
                NotificationEvent::Complete,
                NotificationDetails::complete(result, sandbox),
            )
        } else {
            (
                NotificationEvent::Error,
                NotificationDetails::error(result, sandbox),
            )
        };
        self.notify(event, &details).await;
    }
}

/// POSTs the event with up to three attempts, backing off 2s then 4s.
/// Only 5xx, 429 and network errors are retried.
#[allow(tail_expr_drop_order)]
async fn send_webhook(
    url: &str,
    event: NotificationEvent,
    details: &NotificationDetails,
) -> Result<()> {
    let payload = json!({
        "event": event.as_str(),
        "message": details.message,
        "timestamp": details.timestamp,
        "context": details.context,
    });

    debug!("Sending webhook to {}: {:?}", url, payload);

    let client = reqwest::Client::new();
    let max_attempts = 3;
    let mut last_error = None;

    for attempt in 0..max_attempts {
        if attempt > 0 {
            let delay_secs = 1u64 << attempt;
            debug!(
                "Webhook retry attempt {} after {}s delay",
                attempt + 1,
                delay_secs
            );
            tokio::time::sleep(std::time::Duration::from_secs(delay_secs)).await;
        }

        match client.post(url).json(&payload).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    debug!("Webhook sent successfully");
                    return Ok(());
                }

                let status = response.status();
                let body = response.text().await.unwrap_or_default();

                if status.is_server_error() || status.as_u16() == 429 {
                    last_error = Some(format!("Webhook returned {status}: {body}"));
                    continue;
                }

                anyhow::bail!("Webhook returned error status {status}: {body}");
            }
            Err(e) => {
                last_error = Some(e.to_string());
            }
        }
    }

    anyhow::bail!(
        "Webhook failed after {max_attempts} attempts: {}",
        last_error.unwrap_or_else(|| "unknown error".to_string())
    )
}

fn send_desktop_notification(title: &str, body: &str) -> Result<()> {
    if Command::new("notify-send")
        .args([title, body])
        .output()
        .is_ok()
    {
        return Ok(());
    }

    if Command::new("osascript")
        .args([
            "-e",
            &format!(
                "display notification \"{}\" with title \"{}\"",
                body.replace('"', "\\\""),
                title.replace('"', "\\\"")
            ),
        ])
        .output()
        .is_ok()
    {
        return Ok(());
    }

    anyhow::bail!("No desktop notification command available (tried notify-send, osascript)");
}

/// Payload of a notification.
#[derive(Debug, Clone)]
pub(crate) struct NotificationDetails {
    pub message: String,
    pub timestamp: String,
    pub context: serde_json::Value,
}

impl NotificationDetails {
    pub fn complete(result: &PipelineResult, sandbox: Option<&str>) -> Self {
        let count = result.repos.len();
        Self {
            message: format!(
                "Set up {count} {}",
                if count == 1 { "repository" } else { "repositories" }
            ),
            timestamp: Utc::now().to_rfc3339(),
            context: context(result, sandbox),
        }
    }

    pub fn error(result: &PipelineResult, sandbox: Option<&str>) -> Self {
        let failed: Vec<&str> = result.failed().map(|r| r.name.as_str()).collect();
        Self {
            message: format!("Setup failed for {}", failed.join(", ")),
            timestamp: Utc::now().to_rfc3339(),
            context: context(result, sandbox),
        }
    }
}

fn context(result: &PipelineResult, sandbox: Option<&str>) -> serde_json::Value {
    json!({
        "sandbox": sandbox,
        "repos": result.repos.iter().map(|r| json!({
            "name": r.name,
            "success": r.success,
        })).collect::<Vec<_>>(),
    })
}
