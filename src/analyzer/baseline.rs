use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Diagnostic;
use crate::storage::StateDir;

const BASELINES: &str = "baselines";

/// Persisted EMA of appended lines per run for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineRecord {
    pub identifier: String,
    pub baseline_lines: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Increase,
    Decrease,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnomalyResult {
    /// No usable baseline existed; it was seeded with this run's count
    Initialized { baseline: f64 },
    Normal { baseline: f64, deviation_percent: f64 },
    Anomalous {
        direction: Direction,
        /// Baseline before this run's update
        baseline: f64,
        count: u64,
        deviation_percent: f64,
    },
}

impl AnomalyResult {
    pub fn is_anomalous(&self) -> bool {
        matches!(self, AnomalyResult::Anomalous { .. })
    }

    pub fn message(&self, source: &str) -> Option<String> {
        match self {
            AnomalyResult::Anomalous { direction, baseline, count, deviation_percent } => {
                let verb = match direction {
                    Direction::Increase => "surged",
                    Direction::Decrease => "dropped",
                };
                Some(format!(
                    "Log {} line volume {} ({:.1} -> {} lines, {:+.1}%)",
                    source, verb, baseline, count, deviation_percent
                ))
            }
            _ => None,
        }
    }
}

/// One EMA step
pub fn ema(baseline: f64, sample: f64, alpha: f64) -> f64 {
    (1.0 - alpha) * baseline + alpha * sample
}

/// Tracks "typical" log volume per source and flags runs that deviate from it.
///
/// The baseline follows drift: it is updated after every classification,
/// anomalous or not, so a persistently higher volume stops alerting.
pub struct BaselineEstimator {
    state: StateDir,
    baselines: HashMap<String, Option<f64>>,
    dirty: Vec<String>,
    diagnostics: Vec<Diagnostic>,
}

impl BaselineEstimator {
    pub fn new(state: StateDir) -> Self {
        Self {
            state,
            baselines: HashMap::new(),
            dirty: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn baseline(&mut self, source_id: &str) -> Option<f64> {
        if let Some(b) = self.baselines.get(source_id) {
            return *b;
        }
        let (rec, err) = self.state.load_or_reseed::<BaselineRecord>(BASELINES, source_id);
        if let Some(e) = err {
            self.diagnostics.push(Diagnostic::new(source_id, &e));
        }
        let b = rec.map(|r| r.baseline_lines).filter(|b| b.is_finite());
        self.baselines.insert(source_id.to_string(), b);
        b
    }

    fn set(&mut self, source_id: &str, value: f64) {
        self.baselines.insert(source_id.to_string(), Some(value));
        if !self.dirty.iter().any(|d| d == source_id) {
            self.dirty.push(source_id.to_string());
        }
    }

    pub fn classify(&mut self, source_id: &str, new_count: u64, alpha: f64, threshold_percent: f64) -> AnomalyResult {
        let sample = new_count as f64;

        let baseline = match self.baseline(source_id) {
            Some(b) if b > 0.0 => b,
            _ => {
                self.set(source_id, sample);
                tracing::debug!(source = %source_id, baseline = sample, "Seeded log baseline");
                return AnomalyResult::Initialized { baseline: sample };
            }
        };

        let deviation_percent = (sample - baseline) / baseline * 100.0;
        self.set(source_id, ema(baseline, sample, alpha));

        if deviation_percent.abs() >= threshold_percent {
            let direction = if deviation_percent > 0.0 { Direction::Increase } else { Direction::Decrease };
            AnomalyResult::Anomalous { direction, baseline, count: new_count, deviation_percent }
        } else {
            AnomalyResult::Normal { baseline, deviation_percent }
        }
    }

    pub fn flush(&mut self) -> Vec<Diagnostic> {
        let mut failed = Vec::new();
        for id in std::mem::take(&mut self.dirty) {
            let Some(Some(baseline_lines)) = self.baselines.get(&id).copied() else { continue };
            let rec = BaselineRecord { identifier: id.clone(), baseline_lines };
            if let Err(e) = self.state.save(BASELINES, &id, &rec) {
                tracing::warn!(source = %id, error = %e, "Failed to persist log baseline");
                failed.push(Diagnostic::new(id, &e));
            }
        }
        failed
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }
}
