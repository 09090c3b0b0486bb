use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Diagnostic, MonitorError};
use crate::types::{Level, MetricKind};

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default, rename = "thresholds")]
    raw_thresholds: toml::Table,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default, rename = "log_analysis")]
    raw_log_analysis: toml::Table,
    #[serde(default, rename = "throttle")]
    raw_throttle: toml::Table,
    #[serde(default, rename = "history")]
    raw_history: toml::Table,
    #[serde(default)]
    pub alerting: AlertingConfig,

    // Sections below are resolved key by key so one bad value falls back to
    // its default instead of rejecting the file.
    #[serde(skip)]
    pub thresholds: ThresholdTable,
    #[serde(skip)]
    pub log_analysis: LogAnalysisConfig,
    #[serde(skip)]
    pub throttle: ThrottleConfig,
    #[serde(skip)]
    pub history: HistoryConfig,
    /// Problems found while validating, reported with every run
    #[serde(skip)]
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            log_level: default_log_level(),
            state_dir: default_state_dir(),
            proc_root: default_proc_root(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    #[serde(default = "default_cpu_sample_ms")]
    pub cpu_sample_ms: u64,
    #[serde(default = "default_disk_mount")]
    pub disk_mount: PathBuf,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self { cpu_sample_ms: default_cpu_sample_ms(), disk_mount: default_disk_mount() }
    }
}

/// Warning/alert/critical bounds for one metric.
///
/// A legacy single-value configuration only sets `warning`; the classifier
/// then degrades to a Normal/Warning signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub warning: f64,
    pub alert: Option<f64>,
    pub critical: Option<f64>,
}

impl Thresholds {
    pub const fn tiered(warning: f64, alert: f64, critical: f64) -> Self {
        Self { warning, alert: Some(alert), critical: Some(critical) }
    }

    pub const fn single(warning: f64) -> Self {
        Self { warning, alert: None, critical: None }
    }

    /// Bound that `level` is reached at, if that level is reachable
    pub fn bound_for(&self, level: Level) -> Option<f64> {
        match level {
            Level::Normal => None,
            Level::Warning => Some(self.warning),
            Level::Alert => self.alert,
            Level::Critical => self.critical,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawThreshold {
    Scalar(f64),
    Tiered {
        warning: f64,
        alert: Option<f64>,
        critical: Option<f64>,
    },
}

/// Per-metric thresholds after validation
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdTable {
    pub cpu: Thresholds,
    pub mem: Thresholds,
    pub disk: Thresholds,
    pub log_lines: Thresholds,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            cpu: Thresholds::tiered(70.0, 85.0, 95.0),
            mem: Thresholds::tiered(70.0, 80.0, 90.0),
            disk: Thresholds::tiered(70.0, 80.0, 90.0),
            log_lines: Thresholds::single(100.0),
        }
    }
}

impl ThresholdTable {
    pub fn get(&self, metric: MetricKind) -> &Thresholds {
        match metric {
            MetricKind::Cpu => &self.cpu,
            MetricKind::Mem => &self.mem,
            MetricKind::Disk => &self.disk,
            MetricKind::Log | MetricKind::LogTrend => &self.log_lines,
        }
    }

    fn slot(&mut self, key: &str) -> Option<(&mut Thresholds, bool)> {
        match key {
            "cpu" => Some((&mut self.cpu, true)),
            "mem" => Some((&mut self.mem, true)),
            "disk" => Some((&mut self.disk, true)),
            "log_lines" => Some((&mut self.log_lines, false)),
            _ => None,
        }
    }

    /// Build the table from the raw `[thresholds]` section. Invalid entries
    /// keep their default and produce a `ConfigInvalid` diagnostic.
    fn resolve(raw: &toml::Table, diagnostics: &mut Vec<Diagnostic>) -> Self {
        let mut table = ThresholdTable::default();

        for (key, value) in raw {
            let Some((slot, is_percent)) = table.slot(key) else {
                tracing::debug!(key = %key, "Ignoring unknown threshold key");
                continue;
            };

            match parse_thresholds(value, is_percent) {
                Ok(t) => *slot = t,
                Err(reason) => {
                    let err = MonitorError::ConfigInvalid { key: format!("thresholds.{}", key), reason };
                    diagnostics.push(Diagnostic::new(format!("thresholds.{}", key), &err));
                }
            }
        }

        table
    }
}

fn parse_thresholds(value: &toml::Value, is_percent: bool) -> std::result::Result<Thresholds, String> {
    let raw: RawThreshold = value
        .clone()
        .try_into()
        .map_err(|e| format!("expected a number or {{ warning, alert, critical }} table: {}", e))?;

    let t = match raw {
        RawThreshold::Scalar(v) => Thresholds::single(v),
        RawThreshold::Tiered { warning, alert, critical } => Thresholds { warning, alert, critical },
    };

    let bounds = [Some(t.warning), t.alert, t.critical];
    for v in bounds.iter().flatten() {
        if !v.is_finite() || *v < 0.0 || (is_percent && *v > 100.0) {
            return Err(format!("bound {} out of range", v));
        }
    }

    let present: Vec<f64> = bounds.into_iter().flatten().collect();
    if present.windows(2).any(|w| w[0] > w[1]) {
        return Err("bounds must be ascending (warning <= alert <= critical)".into());
    }

    Ok(t)
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LogsConfig {
    /// Monitored log paths mapped to an enabled flag
    #[serde(default)]
    pub targets: BTreeMap<String, bool>,
}

impl LogsConfig {
    pub fn enabled_targets(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().filter(|(_, on)| **on).map(|(p, _)| p.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogAnalysisConfig {
    pub anomaly_threshold_percent: f64,
    pub baseline_learning_rate: f64,
    pub trend_threshold_percent: f64,
    pub trend_window_days: usize,
    pub spike_streak_days: usize,
    pub history_retention_days: usize,
}

impl Default for LogAnalysisConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold_percent: 30.0,
            baseline_learning_rate: 0.1,
            trend_threshold_percent: 30.0,
            trend_window_days: 7,
            spike_streak_days: 3,
            history_retention_days: 30,
        }
    }
}

impl LogAnalysisConfig {
    fn resolve(raw: &toml::Table, diagnostics: &mut Vec<Diagnostic>) -> Self {
        let d = Self::default();
        let mut section = Section { name: "log_analysis", table: raw, diagnostics };

        let mut la = Self {
            anomaly_threshold_percent: section.get("anomaly_threshold_percent", d.anomaly_threshold_percent, positive),
            baseline_learning_rate: section.get("baseline_learning_rate", d.baseline_learning_rate, |v: &f64| {
                if *v > 0.0 && *v <= 1.0 { Ok(()) } else { Err(format!("{} not in (0, 1]", v)) }
            }),
            trend_threshold_percent: section.get("trend_threshold_percent", d.trend_threshold_percent, positive),
            trend_window_days: section.get("trend_window_days", d.trend_window_days, |v: &usize| at_least(*v, 2)),
            spike_streak_days: section.get("spike_streak_days", d.spike_streak_days, |v: &usize| at_least(*v, 1)),
            history_retention_days: section.get("history_retention_days", d.history_retention_days, |v: &usize| at_least(*v, 1)),
        };

        // Today's partial entry is kept too, so a streak needs `streak + 1`
        // completed days plus one more slot.
        let needed = (la.spike_streak_days + 2).max(la.trend_window_days + 1);
        if la.history_retention_days < needed {
            section.invalid(
                "history_retention_days",
                format!(
                    "{} days cannot hold a {} day streak and a {} day window, using {}",
                    la.history_retention_days, la.spike_streak_days, la.trend_window_days, needed
                ),
            );
            la.history_retention_days = needed;
        }

        la
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    pub enabled: bool,
    pub escalation_interval_mins: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self { enabled: true, escalation_interval_mins: 60 }
    }
}

impl ThrottleConfig {
    fn resolve(raw: &toml::Table, diagnostics: &mut Vec<Diagnostic>) -> Self {
        let d = Self::default();
        let mut section = Section { name: "throttle", table: raw, diagnostics };

        Self {
            enabled: section.get("enabled", d.enabled, |_: &bool| Ok(())),
            escalation_interval_mins: section.get("escalation_interval_mins", d.escalation_interval_mins, |v: &u64| {
                minutes(*v).map(|_| ()).ok_or_else(|| format!("{} minutes is out of range", v))
            }),
        }
    }

    pub fn escalation_interval(&self) -> chrono::Duration {
        minutes(self.escalation_interval_mins).unwrap_or_else(|| chrono::Duration::minutes(60))
    }
}

fn minutes(mins: u64) -> Option<chrono::Duration> {
    i64::try_from(mins).ok().and_then(chrono::Duration::try_minutes)
}

/// Bounds of the rolling run history files. Zero disables a history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryConfig {
    pub usage_snapshots: usize,
    pub notifications: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { usage_snapshots: 95, notifications: 100 }
    }
}

impl HistoryConfig {
    fn resolve(raw: &toml::Table, diagnostics: &mut Vec<Diagnostic>) -> Self {
        let d = Self::default();
        let mut section = Section { name: "history", table: raw, diagnostics };

        Self {
            usage_snapshots: section.get("usage_snapshots", d.usage_snapshots, |_: &usize| Ok(())),
            notifications: section.get("notifications", d.notifications, |_: &usize| Ok(())),
        }
    }
}

/// One raw config table read key by key. A value of the wrong type or one
/// failing its check keeps the default and records a `ConfigInvalid`.
struct Section<'a> {
    name: &'static str,
    table: &'a toml::Table,
    diagnostics: &'a mut Vec<Diagnostic>,
}

impl Section<'_> {
    fn get<T: DeserializeOwned>(&mut self, key: &str, default: T, check: impl Fn(&T) -> std::result::Result<(), String>) -> T {
        let Some(value) = self.table.get(key) else { return default };

        let parsed = value
            .clone()
            .try_into::<T>()
            .map_err(|e| format!("wrong type: {}", e))
            .and_then(|v| check(&v).map(|_| v));

        match parsed {
            Ok(v) => v,
            Err(reason) => {
                self.invalid(key, reason);
                default
            }
        }
    }

    fn invalid(&mut self, key: &str, reason: String) {
        let key = format!("{}.{}", self.name, key);
        let err = MonitorError::ConfigInvalid { key: key.clone(), reason };
        self.diagnostics.push(Diagnostic::new(key, &err));
    }
}

fn positive(v: &f64) -> std::result::Result<(), String> {
    if v.is_finite() && *v > 0.0 {
        Ok(())
    } else {
        Err(format!("{} must be a positive number", v))
    }
}

fn at_least(v: usize, min: usize) -> std::result::Result<(), String> {
    if v >= min {
        Ok(())
    } else {
        Err(format!("{} is below the minimum of {}", v, min))
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AlertingConfig {
    #[serde(default)]
    pub slack: Option<SlackConfig>,
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
    #[serde(default)]
    pub teams: Option<TeamsConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: String,
    pub username: Option<String>,
    #[serde(default)]
    pub level_filter: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: String,
    pub channel: Option<String>,
    #[serde(default)]
    pub level_filter: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TeamsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: String,
    #[serde(default)]
    pub level_filter: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    pub url: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub level_filter: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;

        let mut config: Config = toml::from_str(&expanded)
            .with_context(|| "Failed to parse configuration")?;

        config.validate();
        Ok(config)
    }

    fn validate(&mut self) {
        let mut diagnostics = Vec::new();
        self.thresholds = ThresholdTable::resolve(&self.raw_thresholds, &mut diagnostics);
        self.log_analysis = LogAnalysisConfig::resolve(&self.raw_log_analysis, &mut diagnostics);
        self.throttle = ThrottleConfig::resolve(&self.raw_throttle, &mut diagnostics);
        self.history = HistoryConfig::resolve(&self.raw_history, &mut diagnostics);
        self.diagnostics = diagnostics;
    }
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .to_string())
}

// Default value functions
fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
fn default_log_level() -> String { "info".to_string() }
fn default_state_dir() -> PathBuf { PathBuf::from("/var/lib/hostwatch") }
fn default_proc_root() -> PathBuf { PathBuf::from("/proc") }
fn default_cpu_sample_ms() -> u64 { 1000 }
fn default_disk_mount() -> PathBuf { PathBuf::from("/") }
