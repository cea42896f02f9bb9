//! Alert delivery.
//!
//! Delivery is best effort: a failed send is reported to the caller and not retried.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::escalation::{Alert, AlertSeverity};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Sink for alerts.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the structured alert log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl NotificationChannel for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        alert.emit();
        Ok(())
    }
}

/// Posts alerts to a chat webhook as an embed.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    fn color(severity: AlertSeverity) -> u32 {
        match severity {
            AlertSeverity::Info => 0x3498db,
            AlertSeverity::Warning => 0xf1c40f,
            AlertSeverity::Urgent => 0xe67e22,
            AlertSeverity::Critical => 0xe74c3c,
        }
    }

    fn body(alert: &Alert) -> serde_json::Value {
        let mut fields = vec![
            json!({ "name": "Ticker", "value": alert.ticker, "inline": true }),
            json!({ "name": "Severity", "value": alert.severity.as_str(), "inline": true }),
            json!({ "name": "Category", "value": alert.category.as_str(), "inline": true }),
        ];
        if let Some(action) = &alert.action {
            fields.push(json!({ "name": "Suggested", "value": action.label, "inline": false }));
        }
        if alert.estimated {
            fields.push(json!({ "name": "Data", "value": "estimated", "inline": true }));
        }

        json!({
            "embeds": [{
                "title": format!("[{}] {}", alert.severity, alert.title),
                "description": alert.message,
                "color": Self::color(alert.severity),
                "timestamp": alert.created_at.to_rfc3339(),
                "fields": fields,
                "footer": { "text": alert.trade_id },
            }]
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&Self::body(alert))
            .send()
            .await
            .context("Webhook request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Webhook returned {}: {}", status, text);
        }

        debug!(alert_id = %alert.id, "Alert delivered to webhook");
        Ok(())
    }
}

/// Channels configured for this process: always the log, plus a webhook when set.
pub fn channels_from_config(
    config: &crate::config::NotificationConfig,
) -> Result<Vec<Box<dyn NotificationChannel>>> {
    let mut channels: Vec<Box<dyn NotificationChannel>> = vec![Box::new(LogNotifier)];
    if let Some(url) = config.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        channels.push(Box::new(WebhookNotifier::new(url)?));
        info!("Webhook alert delivery enabled");
    }
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::AlertCategory;
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alert() -> Alert {
        Alert::new(
            "trade-1",
            "SPY",
            "heavy-loss",
            AlertSeverity::Critical,
            AlertCategory::Loss,
            "Heavy Loss".into(),
            "SPY P&L is -30.0%".into(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_webhook_posts_embed() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let notifier = WebhookNotifier::new(&format!("{}/hook", mock_server.uri())).unwrap();
        notifier.send(&alert()).await.unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["embeds"][0]["title"], "[CRITICAL] Heavy Loss");
        assert_eq!(body["embeds"][0]["color"], 0xe74c3c);
    }

    #[tokio::test]
    async fn test_webhook_error_status_is_reported() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock_server)
            .await;

        let notifier = WebhookNotifier::new(&mock_server.uri()).unwrap();
        let err = notifier.send(&alert()).await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_log_notifier_always_succeeds() {
        assert!(LogNotifier.send(&alert()).await.is_ok());
    }

    #[test]
    fn test_channels_from_config() {
        let mut config = crate::config::NotificationConfig::default();
        assert_eq!(channels_from_config(&config).unwrap().len(), 1);

        config.webhook_url = Some("http://localhost:9/hook".into());
        let channels = channels_from_config(&config).unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[1].name(), "webhook");
    }
}
