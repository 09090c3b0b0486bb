use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::collector::ResourceUsage;
use crate::config::HistoryConfig;
use crate::error::{Diagnostic, MonitorError};
use crate::storage::StateDir;
use crate::types::{Alert, Level};

const RUNS: &str = "runs";
const USAGE: &str = "usage";
const NOTIFICATIONS: &str = "notifications";

/// Resource usage as sampled by one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu: Option<f64>,
    pub mem: Option<f64>,
    pub disk: Option<f64>,
}

/// One delivered notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub level: Level,
    pub reason: String,
    pub value: f64,
    pub message: String,
}

impl From<&Alert> for NotificationRecord {
    fn from(alert: &Alert) -> Self {
        Self {
            timestamp: alert.timestamp,
            metric: alert.throttle_key(),
            level: alert.level,
            reason: alert.reason.to_string(),
            value: alert.value,
            message: alert.message.clone(),
        }
    }
}

impl std::fmt::Display for NotificationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {} ({}): {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.metric,
            self.reason,
            self.message
        )
    }
}

/// Rolling per-run records under `<state_dir>/runs/`, oldest first and
/// capped at the configured number of entries.
pub struct RunHistory {
    state: StateDir,
    limits: HistoryConfig,
}

impl RunHistory {
    pub fn new(state: StateDir, limits: HistoryConfig) -> Self {
        Self { state, limits }
    }

    pub fn record_usage(&self, usage: &ResourceUsage, now: DateTime<Utc>) -> Vec<Diagnostic> {
        let snapshot = UsageSnapshot { timestamp: now, cpu: usage.cpu, mem: usage.mem, disk: usage.disk };
        self.append(USAGE, vec![snapshot], self.limits.usage_snapshots)
    }

    pub fn record_notifications(&self, alerts: &[Alert]) -> Vec<Diagnostic> {
        if alerts.is_empty() {
            return Vec::new();
        }
        let records = alerts.iter().map(NotificationRecord::from).collect();
        self.append(NOTIFICATIONS, records, self.limits.notifications)
    }

    pub fn usage(&self) -> Result<Vec<UsageSnapshot>, MonitorError> {
        Ok(self.state.load(RUNS, USAGE)?.unwrap_or_default())
    }

    /// Most recent `limit` notifications, oldest first
    pub fn notifications(&self, limit: Option<usize>) -> Result<Vec<NotificationRecord>, MonitorError> {
        let mut all: Vec<NotificationRecord> = self.state.load(RUNS, NOTIFICATIONS)?.unwrap_or_default();
        if let Some(n) = limit {
            let excess = all.len().saturating_sub(n);
            all.drain(..excess);
        }
        Ok(all)
    }

    fn append<T: Serialize + DeserializeOwned>(&self, id: &str, items: Vec<T>, limit: usize) -> Vec<Diagnostic> {
        if limit == 0 {
            return Vec::new();
        }

        let mut diagnostics = Vec::new();
        let (stored, err) = self.state.load_or_reseed::<Vec<T>>(RUNS, id);
        if let Some(e) = err {
            diagnostics.push(Diagnostic::new(format!("{}/{}", RUNS, id), &e));
        }

        let mut entries = stored.unwrap_or_default();
        entries.extend(items);
        let excess = entries.len().saturating_sub(limit);
        entries.drain(..excess);

        if let Err(e) = self.state.save(RUNS, id, &entries) {
            tracing::warn!(history = id, error = %e, "Failed to persist run history");
            diagnostics.push(Diagnostic::new(format!("{}/{}", RUNS, id), &e));
        }
        diagnostics
    }
}
