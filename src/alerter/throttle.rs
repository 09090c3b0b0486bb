use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::ThrottleConfig;
use crate::error::Diagnostic;
use crate::storage::StateDir;
use crate::types::Level;

const THROTTLE: &str = "throttle";

/// What the throttle remembers about one metric between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricNotificationState {
    pub metric: String,
    pub last_notified_level: Level,
    pub last_notified_value: f64,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub first_seen_at_current_level: Option<DateTime<Utc>>,
}

impl MetricNotificationState {
    fn cleared(metric: &str) -> Self {
        Self {
            metric: metric.to_string(),
            last_notified_level: Level::Normal,
            last_notified_value: 0.0,
            last_notified_at: None,
            first_seen_at_current_level: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    LevelIncrease,
    Escalation,
    Cooldown,
    LevelDecrease,
    Recovered,
    Unthrottled,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::LevelIncrease => "level_increase",
            Reason::Escalation => "escalation",
            Reason::Cooldown => "cooldown",
            Reason::LevelDecrease => "level_decrease",
            Reason::Recovered => "recovered",
            Reason::Unthrottled => "unthrottled",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub send: bool,
    pub reason: Reason,
}

impl Decision {
    fn send(reason: Reason) -> Self {
        Self { send: true, reason }
    }

    fn suppress(reason: Reason) -> Self {
        Self { send: false, reason }
    }
}

/// Decides per metric whether a classified level should page someone.
///
/// Only degradation pages: a higher level than last notified sends at once,
/// the same level sends again once `escalation_interval` has passed since the
/// last notification, and lower levels or recovery are silent. State only
/// advances through [`record_notification`](Self::record_notification), which
/// callers invoke after a confirmed delivery.
pub struct NotificationThrottle {
    state: StateDir,
    enabled: bool,
    escalation_interval: Duration,
    metrics: HashMap<String, MetricNotificationState>,
    dirty: Vec<String>,
    diagnostics: Vec<Diagnostic>,
}

impl NotificationThrottle {
    pub fn new(state: StateDir, config: &ThrottleConfig) -> Self {
        Self {
            state,
            enabled: config.enabled,
            escalation_interval: config.escalation_interval(),
            metrics: HashMap::new(),
            dirty: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn entry(&mut self, metric: &str) -> &mut MetricNotificationState {
        if !self.metrics.contains_key(metric) {
            let (stored, err) = self.state.load_or_reseed::<MetricNotificationState>(THROTTLE, metric);
            if let Some(e) = err {
                self.diagnostics.push(Diagnostic::new(metric, &e));
            }
            let st = stored.unwrap_or_else(|| MetricNotificationState::cleared(metric));
            self.metrics.insert(metric.to_string(), st);
        }
        self.metrics.entry(metric.to_string()).or_insert_with(|| MetricNotificationState::cleared(metric))
    }

    fn mark_dirty(&mut self, metric: &str) {
        if !self.dirty.iter().any(|d| d == metric) {
            self.dirty.push(metric.to_string());
        }
    }

    pub fn state(&mut self, metric: &str) -> &MetricNotificationState {
        self.entry(metric)
    }

    pub fn should_notify(&mut self, metric: &str, new_level: Level, value: f64, now: DateTime<Utc>) -> Decision {
        let enabled = self.enabled;
        let interval = self.escalation_interval;
        let st = self.entry(metric);

        if new_level == Level::Normal {
            let was_active = st.last_notified_level != Level::Normal || st.first_seen_at_current_level.is_some();
            if was_active {
                *st = MetricNotificationState::cleared(metric);
                tracing::info!(metric, value, "Metric recovered, clearing notification state");
                self.mark_dirty(metric);
            }
            return Decision::suppress(Reason::Recovered);
        }

        if !enabled {
            return Decision::send(Reason::Unthrottled);
        }

        let last = st.last_notified_level;
        if new_level > last {
            return Decision::send(Reason::LevelIncrease);
        }

        if new_level < last {
            st.last_notified_level = new_level;
            st.first_seen_at_current_level = Some(now);
            tracing::debug!(metric, from = %last, to = %new_level, "Level decreased, notification suppressed");
            self.mark_dirty(metric);
            return Decision::suppress(Reason::LevelDecrease);
        }

        match st.last_notified_at {
            Some(at) if now - at >= interval => Decision::send(Reason::Escalation),
            Some(_) => Decision::suppress(Reason::Cooldown),
            None => Decision::send(Reason::LevelIncrease),
        }
    }

    /// Record a delivered notification. Never call this for a failed dispatch.
    pub fn record_notification(&mut self, metric: &str, level: Level, value: f64, now: DateTime<Utc>) {
        let st = self.entry(metric);
        if level != st.last_notified_level || st.first_seen_at_current_level.is_none() {
            st.first_seen_at_current_level = Some(now);
        }
        st.last_notified_level = level;
        st.last_notified_value = value;
        st.last_notified_at = Some(now);
        self.mark_dirty(metric);
    }

    /// How long `metric` has been at its current tracked level
    pub fn level_age(&mut self, metric: &str, now: DateTime<Utc>) -> Option<Duration> {
        self.entry(metric).first_seen_at_current_level.map(|t| now - t)
    }

    pub fn flush(&mut self) -> Vec<Diagnostic> {
        let mut failed = Vec::new();
        for metric in std::mem::take(&mut self.dirty) {
            let Some(st) = self.metrics.get(&metric) else { continue };
            if let Err(e) = self.state.save(THROTTLE, &metric, st) {
                tracing::warn!(metric = %metric, error = %e, "Failed to persist notification state");
                failed.push(Diagnostic::new(metric, &e));
            }
        }
        failed
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn mins(m: i64) -> DateTime<Utc> {
        t0() + Duration::minutes(m)
    }

    fn throttle(dir: &tempfile::TempDir) -> NotificationThrottle {
        let state = StateDir::open(dir.path()).unwrap();
        NotificationThrottle::new(state, &ThrottleConfig { enabled: true, escalation_interval_mins: 60 })
    }

    /// Decide, and record when the decision is to send (a successful dispatch)
    fn step(th: &mut NotificationThrottle, level: Level, value: f64, now: DateTime<Utc>) -> Decision {
        let d = th.should_notify("cpu", level, value, now);
        if d.send {
            th.record_notification("cpu", level, value, now);
        }
        d
    }

    #[test]
    fn escalation_timeline() {
        let dir = tempfile::tempdir().unwrap();
        let mut th = throttle(&dir);

        assert_eq!(step(&mut th, Level::Warning, 72.0, mins(0)), Decision::send(Reason::LevelIncrease));
        assert_eq!(step(&mut th, Level::Warning, 73.0, mins(5)), Decision::suppress(Reason::Cooldown));
        assert_eq!(step(&mut th, Level::Warning, 74.0, mins(61)), Decision::send(Reason::Escalation));
        assert_eq!(step(&mut th, Level::Alert, 88.0, mins(65)), Decision::send(Reason::LevelIncrease));

        let st = th.state("cpu").clone();
        assert_eq!(st.last_notified_level, Level::Alert);
        assert_eq!(st.last_notified_value, 88.0);
        assert_eq!(st.last_notified_at, Some(mins(65)));
        assert_eq!(st.first_seen_at_current_level, Some(mins(65)));
    }

    #[test]
    fn escalation_keeps_first_seen_clock() {
        let dir = tempfile::tempdir().unwrap();
        let mut th = throttle(&dir);
        step(&mut th, Level::Warning, 72.0, mins(0));
        step(&mut th, Level::Warning, 72.0, mins(61));
        assert_eq!(th.level_age("cpu", mins(70)), Some(Duration::minutes(70)));
    }

    #[test]
    fn recovery_is_silent_and_clears_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut th = throttle(&dir);
        step(&mut th, Level::Critical, 99.0, mins(0));

        assert_eq!(step(&mut th, Level::Normal, 10.0, mins(1)), Decision::suppress(Reason::Recovered));
        let st = th.state("cpu").clone();
        assert_eq!(st.last_notified_level, Level::Normal);
        assert!(st.first_seen_at_current_level.is_none());
        assert!(st.last_notified_at.is_none());

        assert_eq!(step(&mut th, Level::Warning, 71.0, mins(2)), Decision::send(Reason::LevelIncrease));
    }

    #[test]
    fn decrease_is_silent_and_rearms_increase() {
        let dir = tempfile::tempdir().unwrap();
        let mut th = throttle(&dir);
        step(&mut th, Level::Critical, 99.0, mins(0));

        assert_eq!(step(&mut th, Level::Warning, 75.0, mins(1)), Decision::suppress(Reason::LevelDecrease));
        assert_eq!(th.state("cpu").last_notified_level, Level::Warning);
        assert_eq!(step(&mut th, Level::Warning, 75.0, mins(2)), Decision::suppress(Reason::Cooldown));
        assert_eq!(step(&mut th, Level::Critical, 97.0, mins(3)), Decision::send(Reason::LevelIncrease));
    }

    #[test]
    fn failed_dispatch_does_not_start_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let mut th = throttle(&dir);

        let first = th.should_notify("cpu", Level::Alert, 90.0, t0());
        assert!(first.send);
        // delivery failed: nothing recorded
        let retry = th.should_notify("cpu", Level::Alert, 90.0, t0() + Duration::seconds(1));
        assert_eq!(retry, Decision::send(Reason::LevelIncrease));

        th.record_notification("cpu", Level::Alert, 90.0, t0() + Duration::seconds(1));
        let escalation_due = th.should_notify("cpu", Level::Alert, 90.0, mins(62));
        assert!(escalation_due.send);
        // escalation delivery failed too: still due a second later
        let again = th.should_notify("cpu", Level::Alert, 90.0, mins(62) + Duration::seconds(1));
        assert_eq!(again, Decision::send(Reason::Escalation));
    }

    #[test]
    fn disabled_throttle_sends_every_degraded_level() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let mut th = NotificationThrottle::new(state, &ThrottleConfig { enabled: false, escalation_interval_mins: 60 });
        step(&mut th, Level::Warning, 72.0, mins(0));
        assert_eq!(step(&mut th, Level::Warning, 72.0, mins(1)), Decision::send(Reason::Unthrottled));
        assert!(!step(&mut th, Level::Normal, 1.0, mins(2)).send);
    }

    #[test]
    fn state_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let mut th = throttle(&dir);
        step(&mut th, Level::Alert, 86.0, mins(0));
        assert!(th.flush().is_empty());

        let mut next_run = throttle(&dir);
        assert_eq!(
            next_run.should_notify("cpu", Level::Alert, 86.0, mins(10)),
            Decision::suppress(Reason::Cooldown)
        );
    }

    #[test]
    fn corrupt_state_is_reseeded() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        let path = state.blob_path(THROTTLE, "cpu");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "garbage").unwrap();

        let mut th = throttle(&dir);
        assert_eq!(
            th.should_notify("cpu", Level::Warning, 71.0, t0()),
            Decision::send(Reason::LevelIncrease)
        );
        let diags = th.take_diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, "StateCorrupt");
    }
}
