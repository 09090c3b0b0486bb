pub mod baseline;
pub mod threshold;
pub mod trend;

use smallvec::SmallVec;

use crate::types::{Label, Level, MetricKind};

/// A classified observation that still has to pass the notification throttle
#[derive(Debug, Clone)]
pub struct Finding {
    pub metric: MetricKind,
    /// Log source identifier, `None` for resource metrics
    pub source: Option<String>,
    pub level: Level,
    pub value: f64,
    pub threshold: Option<f64>,
    pub message: String,
    pub labels: SmallVec<[Label; 4]>,
}

impl Finding {
    pub fn throttle_key(&self) -> String {
        crate::types::throttle_key(self.metric, self.source.as_deref())
    }
}
