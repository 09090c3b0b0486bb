pub mod agent;
pub mod alerter;
pub mod analyzer;
pub mod collector;
pub mod config;
pub mod error;
pub mod history;
pub mod log_watcher;
pub mod storage;

/// Common types used across modules
pub mod types {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use smallvec::SmallVec;

    /// Severity of a classified metric value. Comparisons use this ordering,
    /// never the raw value.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Level {
        #[default]
        Normal,
        Warning,
        Alert,
        Critical,
    }

    impl Level {
        pub fn parse(s: &str) -> Option<Self> {
            match s.to_ascii_lowercase().as_str() {
                "normal" => Some(Level::Normal),
                "warning" | "warn" => Some(Level::Warning),
                "alert" => Some(Level::Alert),
                "critical" => Some(Level::Critical),
                _ => None,
            }
        }
    }

    /// Kind of metric being evaluated
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum MetricKind {
        Cpu,
        Mem,
        Disk,
        /// Appended line volume of one log source
        Log,
        /// Day-over-day volume trend of one log source
        LogTrend,
    }

    /// A label key-value pair
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Label {
        pub key: String,
        pub value: String,
    }

    /// An alert that passed the throttle and should be dispatched
    #[derive(Debug, Clone, Serialize)]
    pub struct Alert {
        pub timestamp: DateTime<Utc>,
        pub level: Level,
        pub metric: MetricKind,
        /// Log source identifier, `None` for resource metrics
        pub source: Option<String>,
        pub value: f64,
        pub threshold: Option<f64>,
        pub reason: &'static str,
        pub message: String,
        pub labels: SmallVec<[Label; 4]>,
        pub hostname: String,
    }

    impl Alert {
        /// Key under which the throttle tracks this alert
        pub fn throttle_key(&self) -> String {
            throttle_key(self.metric, self.source.as_deref())
        }
    }

    pub fn throttle_key(metric: MetricKind, source: Option<&str>) -> String {
        match source {
            Some(id) => format!("{}.{}", metric, id),
            None => metric.to_string(),
        }
    }

    impl std::fmt::Display for Level {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Level::Normal => write!(f, "NORMAL"),
                Level::Warning => write!(f, "WARNING"),
                Level::Alert => write!(f, "ALERT"),
                Level::Critical => write!(f, "CRITICAL"),
            }
        }
    }

    impl std::fmt::Display for MetricKind {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let s = match self {
                MetricKind::Cpu => "cpu",
                MetricKind::Mem => "mem",
                MetricKind::Disk => "disk",
                MetricKind::Log => "log",
                MetricKind::LogTrend => "log_trend",
            };
            write!(f, "{}", s)
        }
    }

}
