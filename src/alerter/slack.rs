use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::SlackConfig;
use crate::types::{Alert, Level};
use super::{parse_level_filter, AlertChannel};

/// Slack webhook alert channel
pub struct SlackChannel {
    webhook_url: String,
    channel: Option<String>,
    level_filter: Vec<Level>,
    client: reqwest::Client,
}

impl SlackChannel {
    pub fn new(config: &SlackConfig) -> Result<Self> {
        Ok(Self {
            webhook_url: config.webhook_url.clone(),
            channel: config.channel.clone(),
            level_filter: parse_level_filter(&config.level_filter),
            client: reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?,
        })
    }

    fn level_color(level: Level) -> &'static str {
        match level {
            Level::Normal => "#2ecc71",
            Level::Warning => "#f39c12",
            Level::Alert => "#e67e22",
            Level::Critical => "#e74c3c",
        }
    }

    fn payload(&self, alert: &Alert) -> Value {
        let mut fields = vec![
            json!({ "title": "Host", "value": &alert.hostname, "short": true }),
            json!({ "title": "Metric", "value": alert.metric.to_string(), "short": true }),
            json!({ "title": "Value", "value": format!("{:.2}", alert.value), "short": true }),
        ];
        if let Some(ref source) = alert.source {
            fields.push(json!({ "title": "Source", "value": source, "short": true }));
        }

        let mut payload = json!({
            "text": format!("[{}] {}", alert.level, alert.message),
            "attachments": [{
                "color": Self::level_color(alert.level),
                "fields": fields,
                "footer": alert.reason,
                "ts": alert.timestamp.timestamp(),
            }]
        });

        if let Some(ref ch) = self.channel {
            payload["channel"] = json!(ch);
        }
        payload
    }
}

#[async_trait]
impl AlertChannel for SlackChannel {
    fn name(&self) -> &str { "slack" }

    fn accepts_level(&self, level: Level) -> bool {
        self.level_filter.is_empty() || self.level_filter.contains(&level)
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        self.client.post(&self.webhook_url)
            .json(&self.payload(alert))
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}
