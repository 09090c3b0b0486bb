use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::WebhookConfig;
use crate::types::{Alert, Level};
use super::{parse_level_filter, AlertChannel};

/// Custom webhook alert channel
pub struct WebhookChannel {
    url: String,
    headers: std::collections::HashMap<String, String>,
    level_filter: Vec<Level>,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        Ok(Self {
            url: config.url.clone(),
            headers: config.headers.clone(),
            level_filter: parse_level_filter(&config.level_filter),
            client: reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?,
        })
    }
}

/// Generic JSON body: the message plus `metric_type`/`metric_value` metadata
fn payload(alert: &Alert) -> Value {
    json!({
        "hostname": &alert.hostname,
        "metric_type": alert.metric.to_string(),
        "metric_value": alert.value,
        "source": alert.source,
        "level": alert.level,
        "reason": alert.reason,
        "threshold": alert.threshold,
        "message": &alert.message,
        "labels": &alert.labels,
        "timestamp": alert.timestamp.to_rfc3339(),
    })
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str { "webhook" }

    fn accepts_level(&self, level: Level) -> bool {
        self.level_filter.is_empty() || self.level_filter.contains(&level)
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let mut req = self.client.post(&self.url).json(&payload(alert));
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }

        req.send().await?.error_for_status()?;
        Ok(())
    }
}
