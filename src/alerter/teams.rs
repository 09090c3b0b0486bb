use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::TeamsConfig;
use crate::types::{Alert, Level};
use super::{parse_level_filter, AlertChannel};

/// Microsoft Teams incoming-webhook channel (legacy MessageCard format)
pub struct TeamsChannel {
    webhook_url: String,
    level_filter: Vec<Level>,
    client: reqwest::Client,
}

impl TeamsChannel {
    pub fn new(config: &TeamsConfig) -> Result<Self> {
        Ok(Self {
            webhook_url: config.webhook_url.clone(),
            level_filter: parse_level_filter(&config.level_filter),
            client: reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?,
        })
    }

    fn theme_color(level: Level) -> &'static str {
        match level {
            Level::Normal => "2ECC71",
            Level::Warning => "F39C12",
            Level::Alert => "E67E22",
            Level::Critical => "E74C3C",
        }
    }

    fn payload(&self, alert: &Alert) -> Value {
        let mut facts = vec![
            json!({ "name": "Host", "value": &alert.hostname }),
            json!({ "name": "Metric", "value": alert.throttle_key() }),
            json!({ "name": "Value", "value": format!("{:.2}", alert.value) }),
            json!({ "name": "Reason", "value": alert.reason }),
        ];
        if let Some(t) = alert.threshold {
            facts.push(json!({ "name": "Threshold", "value": format!("{:.2}", t) }));
        }

        json!({
            "@type": "MessageCard",
            "@context": "https://schema.org/extensions",
            "themeColor": Self::theme_color(alert.level),
            "summary": format!("[{}] {}", alert.level, alert.metric),
            "title": format!("[{}] {} on {}", alert.level, alert.metric, alert.hostname),
            "sections": [{
                "text": &alert.message,
                "facts": facts,
            }]
        })
    }
}

#[async_trait]
impl AlertChannel for TeamsChannel {
    fn name(&self) -> &str { "teams" }

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
