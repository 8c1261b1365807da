//! Delivery of fired dwell events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::analytics::FiredEvent;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub recipient: String,
    pub message: String,
    pub image_path: Option<PathBuf>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// POSTs each notification as JSON.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let resp = self.client.post(&self.url).json(notification).send().await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            recipient = %notification.recipient,
            image = ?notification.image_path,
            "{}",
            notification.message
        );
        Ok(())
    }
}

pub fn render_message(camera_name: &str, event: &FiredEvent) -> String {
    let zones = if event.key.zones.is_empty() {
        "the frame".to_string()
    } else {
        event.key.zones.replace(',', ", ")
    };
    format!(
        "{camera_name}: {} {} {zones} for {} min (confidence {:.2}) at {}",
        event.key.label,
        event.state,
        event.elapsed_minutes,
        event.score,
        event.at.format("%Y-%m-%d %H:%M:%S"),
    )
}

/// One notification per recipient, or a single unaddressed one.
pub fn fan_out(recipients: &[String], message: &str, image_path: Option<PathBuf>) -> Vec<Notification> {
    if recipients.is_empty() {
        return vec![Notification {
            recipient: String::new(),
            message: message.to_string(),
            image_path,
        }];
    }
    recipients
        .iter()
        .map(|r| Notification {
            recipient: r.clone(),
            message: message.to_string(),
            image_path: image_path.clone(),
        })
        .collect()
}

/// Sends in the background; failures are logged and dropped.
pub fn dispatch(notifier: Arc<dyn Notifier>, notifications: Vec<Notification>) {
    for notification in notifications {
        let notifier = notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.send(&notification).await {
                tracing::warn!(recipient = %notification.recipient, error = %e, "notification failed");
            }
        });
    }
}
