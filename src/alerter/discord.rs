use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::config::DiscordConfig;
use crate::types::{Alert, Level};
use super::{parse_level_filter, AlertChannel};

/// Discord webhook alert channel
pub struct DiscordChannel {
    webhook_url: String,
    username: String,
    level_filter: Vec<Level>,
    client: reqwest::Client,
}

impl DiscordChannel {
    pub fn new(config: &DiscordConfig) -> Result<Self> {
        Ok(Self {
            webhook_url: config.webhook_url.clone(),
            username: config.username.clone().unwrap_or_else(|| "hostwatch".into()),
            level_filter: parse_level_filter(&config.level_filter),
            client: reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?,
        })
    }

    fn level_color(level: Level) -> u32 {
        match level {
            Level::Normal => 0x2ECC71,   // green
            Level::Warning => 0xF39C12,  // yellow
            Level::Alert => 0xE67E22,    // orange
            Level::Critical => 0xE74C3C, // red
        }
    }

    /// One embed per alert; threshold and source fields only when known
    fn payload(&self, alert: &Alert) -> serde_json::Value {
        let mut fields = vec![
            json!({ "name": "Host", "value": &alert.hostname, "inline": true }),
            json!({ "name": "Metric", "value": alert.throttle_key(), "inline": true }),
            json!({ "name": "Value", "value": format!("{:.2}", alert.value), "inline": true }),
        ];
        if let Some(t) = alert.threshold {
            fields.push(json!({ "name": "Threshold", "value": format!("{:.2}", t), "inline": true }));
        }
        if let Some(path) = alert.labels.iter().find(|l| l.key == "path") {
            fields.push(json!({ "name": "Source", "value": &path.value, "inline": false }));
        }

        json!({
            "username": self.username,
            "embeds": [{
                "title": format!("[{}] {}", alert.level, alert.metric),
                "description": &alert.message,
                "color": Self::level_color(alert.level),
                "fields": fields,
                "footer": { "text": alert.reason },
                "timestamp": alert.timestamp.to_rfc3339(),
            }]
        })
    }
}

#[async_trait]
impl AlertChannel for DiscordChannel {
    fn name(&self) -> &str { "discord" }

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
