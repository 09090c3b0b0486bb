use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Diagnostic;
use crate::storage::StateDir;

const HISTORY: &str = "history";
const TREND_CHECKS: &str = "trend_checks";

/// Lines appended to one source during one calendar day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    pub line_count: u64,
}

/// Last day a source's completed history was judged for spikes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendCheckRecord {
    pub identifier: String,
    pub last_evaluated: NaiveDate,
}

/// Last day's volume measured against the average of the days before it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailySpike {
    pub date: NaiveDate,
    pub line_count: u64,
    pub average: f64,
    pub increase_percent: f64,
}

impl DailySpike {
    pub fn message(&self, source: &str) -> String {
        format!(
            "Log {} had {} lines on {}, {:.1}% above the recent daily average ({:.1})",
            source, self.line_count, self.date, self.increase_percent, self.average
        )
    }
}

fn mean(entries: &[DailyAggregate]) -> f64 {
    if entries.is_empty() {
        return 0.0;
    }
    entries.iter().map(|e| e.line_count as f64).sum::<f64>() / entries.len() as f64
}

fn increase_percent(value: u64, base: f64) -> f64 {
    (value as f64 - base) / base * 100.0
}

/// True when each of the last `days` entries exceeds the trailing average of
/// the (up to) `days` entries before them by at least `threshold_percent`.
///
/// One non-qualifying day breaks the streak.
pub fn repeated_spikes(entries: &[DailyAggregate], threshold_percent: f64, days: usize) -> bool {
    if days == 0 || entries.len() < days + 1 {
        return false;
    }

    let split = entries.len() - days;
    let base_avg = mean(&entries[split.saturating_sub(days)..split]);
    if base_avg <= 0.0 {
        return false;
    }

    entries[split..]
        .iter()
        .all(|e| increase_percent(e.line_count, base_avg) >= threshold_percent)
}

/// Compare the newest entry within the last `window_days` entries with the
/// mean of the others.
pub fn daily_spike(entries: &[DailyAggregate], threshold_percent: f64, window_days: usize) -> Option<DailySpike> {
    let recent = &entries[entries.len().saturating_sub(window_days)..];
    let (last, before) = recent.split_last()?;
    if before.is_empty() {
        return None;
    }

    let average = mean(before);
    if average <= 0.0 {
        return None;
    }

    let pct = increase_percent(last.line_count, average);
    (pct >= threshold_percent).then_some(DailySpike {
        date: last.date,
        line_count: last.line_count,
        average,
        increase_percent: pct,
    })
}

/// Per-source daily line counts, append/replace-by-date, bounded to a
/// retention window on read.
///
/// Completed days do not change during a day, so spike checks are run once
/// per day: [`trend_due`](Self::trend_due) stays true until
/// [`mark_evaluated`](Self::mark_evaluated) records that day.
pub struct TrendHistoryStore {
    state: StateDir,
    retention_days: usize,
    histories: HashMap<String, Vec<DailyAggregate>>,
    checks: HashMap<String, Option<NaiveDate>>,
    dirty: Vec<String>,
    dirty_checks: Vec<String>,
    diagnostics: Vec<Diagnostic>,
}

impl TrendHistoryStore {
    pub fn new(state: StateDir, retention_days: usize) -> Self {
        Self {
            state,
            retention_days: retention_days.max(1),
            histories: HashMap::new(),
            checks: HashMap::new(),
            dirty: Vec::new(),
            dirty_checks: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn entries(&mut self, source_id: &str) -> &mut Vec<DailyAggregate> {
        if !self.histories.contains_key(source_id) {
            let (stored, err) = self.state.load_or_reseed::<Vec<DailyAggregate>>(HISTORY, source_id);
            if let Some(e) = err {
                self.diagnostics.push(Diagnostic::new(source_id, &e));
            }
            let mut entries = stored.unwrap_or_default();
            entries.sort_by_key(|e| e.date);
            entries.dedup_by_key(|e| e.date);
            let excess = entries.len().saturating_sub(self.retention_days);
            entries.drain(..excess);
            self.histories.insert(source_id.to_string(), entries);
        }
        self.histories.entry(source_id.to_string()).or_default()
    }

    pub fn history(&mut self, source_id: &str) -> Vec<DailyAggregate> {
        self.entries(source_id).clone()
    }

    pub fn count_on(&mut self, source_id: &str, date: NaiveDate) -> u64 {
        self.entries(source_id)
            .iter()
            .find(|e| e.date == date)
            .map_or(0, |e| e.line_count)
    }

    /// Set the count for `date`. Calling twice for the same day replaces.
    pub fn record_daily(&mut self, source_id: &str, date: NaiveDate, count: u64) {
        let retention = self.retention_days;
        let entries = self.entries(source_id);
        match entries.binary_search_by_key(&date, |e| e.date) {
            Ok(i) => entries[i].line_count = count,
            Err(i) => entries.insert(i, DailyAggregate { date, line_count: count }),
        }
        let excess = entries.len().saturating_sub(retention);
        entries.drain(..excess);

        if !self.dirty.iter().any(|d| d == source_id) {
            self.dirty.push(source_id.to_string());
        }
    }

    /// Entries dated strictly before `as_of`, so a partially counted day
    /// never takes part in trend checks.
    fn completed(&mut self, source_id: &str, as_of: NaiveDate) -> Vec<DailyAggregate> {
        self.entries(source_id).iter().filter(|e| e.date < as_of).copied().collect()
    }

    pub fn detect_repeated_spikes(&mut self, source_id: &str, threshold_percent: f64, days: usize, as_of: NaiveDate) -> bool {
        repeated_spikes(&self.completed(source_id, as_of), threshold_percent, days)
    }

    pub fn detect_daily_spike(&mut self, source_id: &str, threshold_percent: f64, window_days: usize, as_of: NaiveDate) -> Option<DailySpike> {
        daily_spike(&self.completed(source_id, as_of), threshold_percent, window_days)
    }

    fn last_evaluated(&mut self, source_id: &str) -> Option<NaiveDate> {
        if let Some(d) = self.checks.get(source_id) {
            return *d;
        }
        let (rec, err) = self.state.load_or_reseed::<TrendCheckRecord>(TREND_CHECKS, source_id);
        if let Some(e) = err {
            self.diagnostics.push(Diagnostic::new(source_id, &e));
        }
        let d = rec.map(|r| r.last_evaluated);
        self.checks.insert(source_id.to_string(), d);
        d
    }

    pub fn trend_due(&mut self, source_id: &str, as_of: NaiveDate) -> bool {
        self.last_evaluated(source_id).map_or(true, |d| d < as_of)
    }

    pub fn mark_evaluated(&mut self, source_id: &str, as_of: NaiveDate) {
        self.checks.insert(source_id.to_string(), Some(as_of));
        if !self.dirty_checks.iter().any(|d| d == source_id) {
            self.dirty_checks.push(source_id.to_string());
        }
    }

    pub fn flush(&mut self) -> Vec<Diagnostic> {
        let mut failed = Vec::new();
        for id in std::mem::take(&mut self.dirty) {
            let Some(entries) = self.histories.get(&id) else { continue };
            if let Err(e) = self.state.save(HISTORY, &id, entries) {
                tracing::warn!(source = %id, error = %e, "Failed to persist log history");
                failed.push(Diagnostic::new(id, &e));
            }
        }
        for id in std::mem::take(&mut self.dirty_checks) {
            let Some(Some(last_evaluated)) = self.checks.get(&id).copied() else { continue };
            let rec = TrendCheckRecord { identifier: id.clone(), last_evaluated };
            if let Err(e) = self.state.save(TREND_CHECKS, &id, &rec) {
                tracing::warn!(source = %id, error = %e, "Failed to persist trend check");
                failed.push(Diagnostic::new(id, &e));
            }
        }
        failed
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }
}
