//! Alert delivery.
//!
//! Every alert is recorded as an event row; delivery to the configured
//! webhook is best effort and never fails the caller. Offline and
//! new-port change detection are deliberate extension points and are
//! not wired into the reconciliation pipeline.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use netpulse_core::config::AlertsConfig;
use netpulse_core::types::{NewEvent, Severity};
use netpulse_store::DeviceStore;

use crate::error::Result;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    title: &'a str,
    message: &'a str,
    severity: &'a str,
    timestamp: String,
    metadata: &'a serde_json::Value,
}

pub struct AlertService {
    config: AlertsConfig,
    store: Arc<DeviceStore>,
    client: reqwest::Client,
}

impl AlertService {
    pub fn new(config: AlertsConfig, store: Arc<DeviceStore>) -> Self {
        Self {
            config,
            store,
            client: reqwest::Client::new(),
        }
    }

    /// Record an alert event and push it to the enabled channels.
    ///
    /// Channel delivery failures are logged, not propagated; the event
    /// row is the durable record.
    pub async fn send_alert(
        &self,
        title: &str,
        message: &str,
        severity: Severity,
        device_id: Option<i64>,
        metadata: serde_json::Value,
    ) -> Result<i64> {
        if !self.config.enabled {
            tracing::debug!(title, "Alerts disabled, skipping");
            return Ok(0);
        }

        let event_id = self.store.create_event(&NewEvent {
            event_type: "alert".to_string(),
            severity,
            device_id,
            title: title.to_string(),
            description: Some(message.to_string()),
            metadata: metadata.clone(),
        })?;

        if self.config.webhook.enabled {
            self.post_webhook(title, message, severity, &metadata).await;
        }

        Ok(event_id)
    }

    async fn post_webhook(
        &self,
        title: &str,
        message: &str,
        severity: Severity,
        metadata: &serde_json::Value,
    ) {
        let Some(url) = self.config.webhook.url.as_deref() else {
            tracing::warn!("Webhook enabled but URL not configured");
            return;
        };

        let payload = WebhookPayload {
            title,
            message,
            severity: severity.as_str(),
            timestamp: Utc::now().to_rfc3339(),
            metadata,
        };

        let result = self
            .client
            .post(url)
            .json(&payload)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .and_then(|resp| resp.error_for_status());

        match result {
            Ok(_) => tracing::info!(title, "Webhook alert sent"),
            Err(e) => tracing::error!(title, error = %e, "Webhook alert failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netpulse_core::config::WebhookConfig;

    #[tokio::test]
    async fn alert_is_recorded_as_event() {
        let store = Arc::new(DeviceStore::open_in_memory().unwrap());
        let service = AlertService::new(AlertsConfig::default(), store.clone());

        service
            .send_alert(
                "Suspicious device",
                "Device 10.0.0.5 has RDP exposed",
                Severity::Warning,
                None,
                serde_json::json!({"port": 3389}),
            )
            .await
            .unwrap();

        let events = store.list_events(10, None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "alert");
        assert_eq!(events[0].severity, Severity::Warning);
        assert_eq!(events[0].metadata["port"], 3389);
    }

    #[tokio::test]
    async fn disabled_alerts_record_nothing() {
        let store = Arc::new(DeviceStore::open_in_memory().unwrap());
        let config = AlertsConfig {
            enabled: false,
            ..AlertsConfig::default()
        };
        let service = AlertService::new(config, store.clone());

        service
            .send_alert("ignored", "ignored", Severity::Info, None, serde_json::Value::Null)
            .await
            .unwrap();
        assert!(store.list_events(10, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_webhook_does_not_fail_the_alert() {
        let store = Arc::new(DeviceStore::open_in_memory().unwrap());
        let config = AlertsConfig {
            enabled: true,
            webhook: WebhookConfig {
                enabled: true,
                url: Some("http://127.0.0.1:1/unreachable".to_string()),
            },
            ..AlertsConfig::default()
        };
        let service = AlertService::new(config, store.clone());

        let result = service
            .send_alert("t", "m", Severity::Critical, None, serde_json::Value::Null)
            .await;
        assert!(result.is_ok());
        assert_eq!(store.list_events(10, None).unwrap().len(), 1);
    }
}
