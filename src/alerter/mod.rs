pub mod discord;
pub mod slack;
pub mod teams;
pub mod throttle;
pub mod webhook;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::AlertingConfig;
use crate::types::{Alert, Level};

/// Trait for alert delivery channels
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Channel name
    fn name(&self) -> &str;

    /// Send a single alert
    async fn send(&self, alert: &Alert) -> Result<()>;

    /// Check if this channel accepts the given level
    fn accepts_level(&self, level: Level) -> bool;
}

/// Delivers approved alerts. Returns whether delivery succeeded; the run only
/// records a notification in the throttle when this returns `true`.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, alert: &Alert) -> bool;
}

/// Parse a configured level filter, dropping unknown names
pub(crate) fn parse_level_filter(names: &[String]) -> Vec<Level> {
    names.iter().filter_map(|s| Level::parse(s)).collect()
}

/// Fans an alert out to every configured channel
pub struct AlertManager {
    channels: Vec<Box<dyn AlertChannel>>,
}

impl AlertManager {
    pub fn new(config: &AlertingConfig) -> Result<Self> {
        let mut channels: Vec<Box<dyn AlertChannel>> = Vec::new();

        if let Some(ref sc) = config.slack {
            if sc.enabled {
                channels.push(Box::new(slack::SlackChannel::new(sc)?));
            }
        }

        if let Some(ref dc) = config.discord {
            if dc.enabled {
                channels.push(Box::new(discord::DiscordChannel::new(dc)?));
            }
        }

        if let Some(ref tc) = config.teams {
            if tc.enabled {
                channels.push(Box::new(teams::TeamsChannel::new(tc)?));
            }
        }

        if let Some(ref wc) = config.webhook {
            if wc.enabled {
                channels.push(Box::new(webhook::WebhookChannel::new(wc)?));
            }
        }

        tracing::info!(channels = channels.len(), "Initialized alert channels");

        Ok(Self { channels })
    }

    pub fn with_channels(channels: Vec<Box<dyn AlertChannel>>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl Dispatcher for AlertManager {
    /// Succeeds when at least one accepting channel delivered. With no
    /// channel configured (or none accepting this level) the alert is only
    /// logged and counts as delivered.
    async fn dispatch(&self, alert: &Alert) -> bool {
        let targets: Vec<&dyn AlertChannel> = self
            .channels
            .iter()
            .map(|c| c.as_ref())
            .filter(|c| c.accepts_level(alert.level))
            .collect();

        if targets.is_empty() {
            tracing::info!(
                metric = %alert.metric,
                level = %alert.level,
                message = %alert.message,
                "No channel for alert, logged only"
            );
            return true;
        }

        let mut delivered = false;
        for channel in targets {
            match channel.send(alert).await {
                Ok(()) => {
                    tracing::debug!(channel = channel.name(), metric = %alert.metric, "Alert delivered");
                    delivered = true;
                }
                Err(e) => {
                    tracing::error!(
                        channel = channel.name(),
                        error = %e,
                        "Failed to send alert"
                    );
                }
            }
        }

        delivered
    }
}
