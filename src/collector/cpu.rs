use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::MetricKind;
use super::Collector;

/// Cumulative jiffies from the aggregate `cpu` line of /proc/stat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    total: u64,
    idle: u64,
}

/// Collects overall CPU usage from two /proc/stat reads a short interval apart
pub struct CpuCollector {
    stat_path: PathBuf,
    sample_interval: Duration,
}

impl CpuCollector {
    pub fn new(proc_root: &Path, sample_ms: u64) -> Self {
        Self {
            stat_path: proc_root.join("stat"),
            sample_interval: Duration::from_millis(sample_ms),
        }
    }

    async fn read_times(&self) -> Result<CpuTimes> {
        let content = tokio::fs::read_to_string(&self.stat_path)
            .await
            .with_context(|| format!("reading {}", self.stat_path.display()))?;
        parse_stat(&content).context("no aggregate cpu line in /proc/stat")
    }
}

fn parse_stat(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();

    if fields.len() < 4 {
        return None;
    }

    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0); // idle + iowait
    Some(CpuTimes { total, idle })
}

fn usage_between(prev: CpuTimes, cur: CpuTimes) -> Option<f64> {
    let d_total = cur.total.saturating_sub(prev.total);
    let d_idle = cur.idle.saturating_sub(prev.idle);
    if d_total == 0 {
        return None;
    }
    Some(100.0 * (1.0 - d_idle as f64 / d_total as f64))
}

#[async_trait]
impl Collector for CpuCollector {
    fn name(&self) -> &str {
        "cpu"
    }

    fn metric(&self) -> MetricKind {
        MetricKind::Cpu
    }

    async fn collect(&mut self) -> Result<f64> {
        let first = self.read_times().await?;
        tokio::time::sleep(self.sample_interval).await;
        let second = self.read_times().await?;

        usage_between(first, second).context("no CPU time elapsed between samples")
    }
}
