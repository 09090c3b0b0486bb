use smallvec::smallvec;

use crate::config::{ThresholdTable, Thresholds};
use crate::types::{Level, MetricKind};
use super::Finding;

/// Highest level whose bound `value` meets or exceeds, else `Normal`.
///
/// Single-tier thresholds have no alert/critical bound, so only
/// Normal/Warning can come out of them.
pub fn classify(value: f64, thresholds: &Thresholds) -> Level {
    [Level::Critical, Level::Alert, Level::Warning]
        .into_iter()
        .find(|level| thresholds.bound_for(*level).is_some_and(|bound| value >= bound))
        .unwrap_or(Level::Normal)
}

/// Compares resource usage percentages against configured thresholds.
pub struct ThresholdAnalyzer {
    thresholds: ThresholdTable,
}

impl ThresholdAnalyzer {
    pub fn new(thresholds: &ThresholdTable) -> Self {
        Self { thresholds: thresholds.clone() }
    }

    /// Classify one resource metric. Normal results are still returned so the
    /// throttle can observe the recovery.
    pub fn check_metric(&self, metric: MetricKind, value: f64) -> Finding {
        let thresholds = self.thresholds.get(metric);
        let level = classify(value, thresholds);
        let threshold = thresholds.bound_for(level);

        let message = match threshold {
            Some(t) => format!(
                "{} usage is {:.1}% ({} threshold: {:.1}%)",
                describe(metric), value, level.to_string().to_lowercase(), t
            ),
            None => format!("{} usage is {:.1}%", describe(metric), value),
        };

        Finding {
            metric,
            source: None,
            level,
            value,
            threshold,
            message,
            labels: smallvec![],
        }
    }
}

fn describe(metric: MetricKind) -> &'static str {
    match metric {
        MetricKind::Cpu => "CPU",
        MetricKind::Mem => "Memory",
        MetricKind::Disk => "Disk",
        MetricKind::Log | MetricKind::LogTrend => "Log",
    }
}
