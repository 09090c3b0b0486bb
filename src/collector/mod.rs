pub mod cpu;
pub mod disk;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::error::{Diagnostic, MonitorError};
use crate::types::MetricKind;

/// Trait for resource usage collectors.
///
/// Each collector samples one usage percentage from procfs or the
/// filesystem.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Human-readable name for this collector (e.g., "cpu", "memory")
    fn name(&self) -> &str;

    /// Metric this collector reports
    fn metric(&self) -> MetricKind;

    /// Sample the current usage percentage
    async fn collect(&mut self) -> Result<f64>;
}

/// One sample per resource metric. `None` means sampling failed and the
/// metric is skipped this run; it is never read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu: Option<f64>,
    pub mem: Option<f64>,
    pub disk: Option<f64>,
}

impl ResourceUsage {
    pub fn get(&self, metric: MetricKind) -> Option<f64> {
        match metric {
            MetricKind::Cpu => self.cpu,
            MetricKind::Mem => self.mem,
            MetricKind::Disk => self.disk,
            MetricKind::Log | MetricKind::LogTrend => None,
        }
    }

    fn set(&mut self, metric: MetricKind, value: f64) {
        match metric {
            MetricKind::Cpu => self.cpu = Some(value),
            MetricKind::Mem => self.mem = Some(value),
            MetricKind::Disk => self.disk = Some(value),
            MetricKind::Log | MetricKind::LogTrend => {}
        }
    }

    /// Metrics in evaluation order, with their sample if one was taken
    pub fn iter(&self) -> impl Iterator<Item = (MetricKind, Option<f64>)> + '_ {
        [MetricKind::Cpu, MetricKind::Mem, MetricKind::Disk]
            .into_iter()
            .map(move |m| (m, self.get(m)))
    }
}

/// Create the resource collectors
pub fn create_collectors(config: &Config) -> Vec<Box<dyn Collector>> {
    let collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(cpu::CpuCollector::new(&config.agent.proc_root, config.collector.cpu_sample_ms)),
        Box::new(memory::MemoryCollector::new(&config.agent.proc_root)),
        Box::new(disk::DiskCollector::new(&config.collector.disk_mount)),
    ];

    tracing::debug!(count = collectors.len(), "Initialized collectors");
    collectors
}

/// Sample every collector. Failures leave the metric absent and are
/// reported as diagnostics.
pub async fn get_resource_usage(collectors: &mut [Box<dyn Collector>]) -> (ResourceUsage, Vec<Diagnostic>) {
    let mut usage = ResourceUsage::default();
    let mut diagnostics = Vec::new();

    for c in collectors.iter_mut() {
        match c.collect().await {
            Ok(v) if v.is_finite() => usage.set(c.metric(), v),
            Ok(v) => {
                let err = MonitorError::SamplingFailed(format!("non-finite sample {}", v));
                tracing::warn!(collector = c.name(), error = %err, "Collection failed");
                diagnostics.push(Diagnostic::new(c.name(), &err));
            }
            Err(e) => {
                let err = MonitorError::SamplingFailed(format!("{:#}", e));
                tracing::warn!(collector = c.name(), error = %err, "Collection failed");
                diagnostics.push(Diagnostic::new(c.name(), &err));
            }
        }
    }

    (usage, diagnostics)
}
