use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use smallvec::smallvec;
use std::collections::HashMap;
use std::path::Path;

use crate::alerter::throttle::{NotificationThrottle, Reason};
use crate::alerter::Dispatcher;
use crate::analyzer::baseline::BaselineEstimator;
use crate::analyzer::threshold::{self, ThresholdAnalyzer};
use crate::analyzer::trend::TrendHistoryStore;
use crate::analyzer::Finding;
use crate::collector::{get_resource_usage, Collector, ResourceUsage};
use crate::config::{Config, LogAnalysisConfig};
use crate::error::{Diagnostic, MonitorError};
use crate::history::RunHistory;
use crate::log_watcher::{count_diff, DiffKind, LogPositionStore};
use crate::storage::{source_identifier, StateDir, JOURNAL_SOURCE};
use crate::types::{Alert, Label, Level, MetricKind};

/// Outcome of one monitoring run
#[derive(Debug, Default)]
pub struct RunReport {
    /// Alerts the dispatcher accepted
    pub dispatched: Vec<Alert>,
    /// Alerts that passed the throttle but could not be delivered; they are
    /// retried by the next run
    pub failed: Vec<Alert>,
    /// Non-normal findings held back by the throttle
    pub suppressed: usize,
    pub diagnostics: Vec<Diagnostic>,
}

/// One run's worth of state: the persisted stores plus what the run has
/// found so far. Nothing is written to disk until [`finish`](Self::finish).
pub struct Agent {
    config: Config,
    analyzer: ThresholdAnalyzer,
    positions: LogPositionStore,
    baselines: BaselineEstimator,
    history: TrendHistoryStore,
    throttle: NotificationThrottle,
    runs: RunHistory,
    /// Trend findings waiting on delivery before their day counts as checked
    pending_trends: HashMap<String, (String, NaiveDate)>,
    diagnostics: Vec<Diagnostic>,
    suppressed: usize,
}

impl Agent {
    pub fn open(config: Config) -> Result<Self> {
        let state = StateDir::open(&config.agent.state_dir)
            .with_context(|| format!("Failed to open state directory: {}", config.agent.state_dir.display()))?;

        Ok(Self {
            analyzer: ThresholdAnalyzer::new(&config.thresholds),
            positions: LogPositionStore::new(state.clone()),
            baselines: BaselineEstimator::new(state.clone()),
            history: TrendHistoryStore::new(state.clone(), config.log_analysis.history_retention_days),
            throttle: NotificationThrottle::new(state.clone(), &config.throttle),
            runs: RunHistory::new(state, config.history.clone()),
            pending_trends: HashMap::new(),
            diagnostics: config.diagnostics.clone(),
            suppressed: 0,
            config,
        })
    }

    pub fn push_diagnostics(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        self.diagnostics.extend(diagnostics);
    }

    /// Pass a finding through the throttle, turning it into an alert when it
    /// should be sent.
    fn gate(&mut self, finding: Finding, now: DateTime<Utc>) -> Option<Alert> {
        let key = finding.throttle_key();
        let decision = self.throttle.should_notify(&key, finding.level, finding.value, now);

        if !decision.send {
            if finding.level != Level::Normal {
                self.suppressed += 1;
                tracing::debug!(metric = %key, level = %finding.level, reason = %decision.reason, "Notification suppressed");
            }
            return None;
        }

        let mut message = finding.message;
        if decision.reason == Reason::Escalation {
            if let Some(age) = self.throttle.level_age(&key, now) {
                message = format!(
                    "{} (at {} for {} min)",
                    message, finding.level.to_string().to_lowercase(), age.num_minutes()
                );
            }
        }

        Some(Alert {
            timestamp: now,
            level: finding.level,
            metric: finding.metric,
            source: finding.source,
            value: finding.value,
            threshold: finding.threshold,
            reason: decision.reason.as_str(),
            message,
            labels: finding.labels,
            hostname: self.config.agent.hostname.clone(),
        })
    }

    /// Classify each sampled resource metric. Metrics that could not be
    /// sampled are skipped and leave their throttle state alone.
    pub fn evaluate_resources(&mut self, usage: &ResourceUsage, now: DateTime<Utc>) -> Vec<Alert> {
        let findings: Vec<Finding> = usage
            .iter()
            .filter_map(|(metric, value)| value.map(|v| self.analyzer.check_metric(metric, v)))
            .collect();

        findings.into_iter().filter_map(|f| self.gate(f, now)).collect()
    }

    /// Read every enabled log target and classify what was appended since the
    /// last run.
    pub fn evaluate_logs(&mut self, now: DateTime<Utc>) -> Vec<Alert> {
        let targets: Vec<String> = self.config.logs.enabled_targets().map(str::to_string).collect();
        let today = now.with_timezone(&Local).date_naive();
        let mut claimed: HashMap<String, String> = HashMap::new();
        let mut alerts = Vec::new();

        for path in targets {
            let id = source_identifier(&path);
            if let Some(first) = claimed.get(&id) {
                let err = MonitorError::ConfigInvalid {
                    key: format!("logs.targets.{}", path),
                    reason: format!("identifier {} is already used by {}", id, first),
                };
                tracing::warn!(source = %path, error = %err, "Skipping log source");
                self.diagnostics.push(Diagnostic::new(path, &err));
                continue;
            }
            claimed.insert(id.clone(), path.clone());

            let findings = match self.analyze_source(&path, &id, today) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(source = %path, error = %e, "Skipping log source");
                    self.diagnostics.push(Diagnostic::new(path, &e));
                    continue;
                }
            };

            for finding in findings {
                let key = finding.throttle_key();
                let is_trend = finding.metric == MetricKind::LogTrend;
                match self.gate(finding, now) {
                    Some(alert) => {
                        if is_trend {
                            self.pending_trends.insert(key, (id.clone(), today));
                        }
                        alerts.push(alert);
                    }
                    None if is_trend => self.history.mark_evaluated(&id, today),
                    None => {}
                }
            }
        }

        alerts
    }

    /// Findings for one source: this run's volume when the file was appended
    /// to, and the day-over-day trend once per day.
    fn analyze_source(&mut self, path: &str, id: &str, today: NaiveDate) -> Result<Vec<Finding>, MonitorError> {
        if path == JOURNAL_SOURCE {
            return Err(MonitorError::source_unavailable(path, "journal sources are not supported"));
        }

        let previous = self.positions.load(id);
        let diff = count_diff(Path::new(path), id, previous.as_ref())?;
        self.positions.save(id, diff.updated.clone());

        let la = self.config.log_analysis.clone();
        let mut findings = Vec::new();

        if diff.kind == DiffKind::Appended {
            let count = diff.new_line_count;
            let day_total = self.history.count_on(id, today) + count;
            self.history.record_daily(id, today, day_total);

            let mut level = Level::Normal;
            let mut threshold = None;
            let mut notes: Vec<String> = Vec::new();

            let bounds = self.config.thresholds.get(MetricKind::Log);
            let count_level = threshold::classify(count as f64, bounds);
            if let Some(bound) = bounds.bound_for(count_level) {
                notes.push(format!(
                    "Log {} grew by {} lines ({} threshold: {})",
                    path, count, count_level.to_string().to_lowercase(), bound
                ));
                threshold = Some(bound);
                level = count_level;
            }

            let anomaly = self.baselines.classify(id, count, la.baseline_learning_rate, la.anomaly_threshold_percent);
            if let Some(msg) = anomaly.message(path) {
                level = level.max(Level::Warning);
                notes.push(msg);
            }

            let message = if notes.is_empty() {
                format!("Log {} received {} new lines", path, count)
            } else {
                notes.join("; ")
            };

            findings.push(Finding {
                metric: MetricKind::Log,
                source: Some(id.to_string()),
                level,
                value: count as f64,
                threshold,
                message,
                labels: smallvec![Label { key: "path".into(), value: path.to_string() }],
            });
        } else {
            tracing::info!(source = %id, kind = ?diff.kind, lines = diff.new_line_count, "Log source position reset, volume not evaluated");
        }

        if self.history.trend_due(id, today) {
            findings.push(self.trend_finding(path, id, today, &la));
        }

        Ok(findings)
    }

    /// Classify the completed days of a source's history
    fn trend_finding(&mut self, path: &str, id: &str, today: NaiveDate, la: &LogAnalysisConfig) -> Finding {
        let mut level = Level::Normal;
        let mut value = 0.0;
        let mut notes: Vec<String> = Vec::new();

        if let Some(spike) = self.history.detect_daily_spike(id, la.trend_threshold_percent, la.trend_window_days, today) {
            level = Level::Warning;
            value = spike.line_count as f64;
            notes.push(spike.message(path));
        }

        if self.history.detect_repeated_spikes(id, la.trend_threshold_percent, la.spike_streak_days, today) {
            level = Level::Alert;
            notes.push(format!("Log {} volume spiked {} days in a row", path, la.spike_streak_days));
        }

        let message = if notes.is_empty() {
            format!("Log {} daily volume is within its usual range", path)
        } else {
            notes.join("; ")
        };

        Finding {
            metric: MetricKind::LogTrend,
            source: Some(id.to_string()),
            level,
            value,
            threshold: None,
            message,
            labels: smallvec![Label { key: "path".into(), value: path.to_string() }],
        }
    }

    /// Hand each alert to the dispatcher. Only delivered alerts advance the
    /// throttle, so a failed one is retried on the next run.
    pub async fn dispatch(&mut self, alerts: Vec<Alert>, dispatcher: &dyn Dispatcher) -> (Vec<Alert>, Vec<Alert>) {
        let mut dispatched = Vec::new();
        let mut failed = Vec::new();

        for alert in alerts {
            if dispatcher.dispatch(&alert).await {
                tracing::info!(
                    metric = %alert.throttle_key(),
                    level = %alert.level,
                    reason = alert.reason,
                    "Alert dispatched"
                );
                let key = alert.throttle_key();
                self.throttle.record_notification(&key, alert.level, alert.value, alert.timestamp);
                if let Some((id, day)) = self.pending_trends.remove(&key) {
                    self.history.mark_evaluated(&id, day);
                }
                dispatched.push(alert);
            } else {
                let err = MonitorError::DispatchFailed(alert.message.clone());
                tracing::warn!(metric = %alert.throttle_key(), error = %err, "Alert not delivered");
                self.diagnostics.push(Diagnostic::new(alert.throttle_key(), &err));
                failed.push(alert);
            }
        }

        (dispatched, failed)
    }

    /// Append this run's usage sample and delivered alerts to the rolling
    /// run history.
    pub fn record_run(&mut self, usage: &ResourceUsage, dispatched: &[Alert], now: DateTime<Utc>) {
        let mut diagnostics = self.runs.record_usage(usage, now);
        diagnostics.extend(self.runs.record_notifications(dispatched));
        self.diagnostics.extend(diagnostics);
    }

    /// Persist all state and return every diagnostic gathered during the run
    pub fn finish(mut self) -> Vec<Diagnostic> {
        let mut diagnostics = std::mem::take(&mut self.diagnostics);

        diagnostics.extend(self.positions.take_diagnostics());
        diagnostics.extend(self.baselines.take_diagnostics());
        diagnostics.extend(self.history.take_diagnostics());
        diagnostics.extend(self.throttle.take_diagnostics());

        diagnostics.extend(self.positions.flush());
        diagnostics.extend(self.baselines.flush());
        diagnostics.extend(self.history.flush());
        diagnostics.extend(self.throttle.flush());

        diagnostics
    }
}

/// Sample resources, scan logs, dispatch whatever the throttle lets through,
/// then persist state.
pub async fn run_once(
    config: Config,
    collectors: &mut [Box<dyn Collector>],
    dispatcher: &dyn Dispatcher,
    now: DateTime<Utc>,
) -> Result<RunReport> {
    let mut agent = Agent::open(config)?;

    let (usage, sampling) = get_resource_usage(collectors).await;
    agent.push_diagnostics(sampling);

    let mut alerts = agent.evaluate_resources(&usage, now);
    alerts.extend(agent.evaluate_logs(now));

    let (dispatched, failed) = agent.dispatch(alerts, dispatcher).await;
    agent.record_run(&usage, &dispatched, now);
    let suppressed = agent.suppressed;
    let diagnostics = agent.finish();

    for d in &diagnostics {
        tracing::warn!(subject = %d.subject, kind = d.kind, "{}", d.detail);
    }

    Ok(RunReport { dispatched, failed, suppressed, diagnostics })
}
