use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::types::MetricKind;
use super::Collector;

/// Collects memory usage from /proc/meminfo
pub struct MemoryCollector {
    meminfo_path: PathBuf,
}

impl MemoryCollector {
    pub fn new(proc_root: &Path) -> Self {
        Self { meminfo_path: proc_root.join("meminfo") }
    }
}

/// Used memory as a percentage of MemTotal
fn parse_meminfo(content: &str) -> Option<f64> {
    let mut total_kb = 0u64;
    let mut available_kb = 0u64;
    let mut free_kb = 0u64;
    let mut buffers_kb = 0u64;
    let mut cached_kb = 0u64;
    let mut has_available = false;

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 { continue; }
        let val: u64 = parts[1].parse().unwrap_or(0);
        match parts[0] {
            "MemTotal:" => total_kb = val,
            "MemAvailable:" => { available_kb = val; has_available = true; }
            "MemFree:" => free_kb = val,
            "Buffers:" => buffers_kb = val,
            "Cached:" => cached_kb = val,
            _ => {}
        }
    }

    // Fallback for kernels without MemAvailable
    if !has_available {
        available_kb = free_kb + buffers_kb + cached_kb;
    }

    if total_kb == 0 {
        return None;
    }
    Some(100.0 * (1.0 - available_kb.min(total_kb) as f64 / total_kb as f64))
}

#[async_trait]
impl Collector for MemoryCollector {
    fn name(&self) -> &str { "memory" }

    fn metric(&self) -> MetricKind { MetricKind::Mem }

    async fn collect(&mut self) -> Result<f64> {
        let content = tokio::fs::read_to_string(&self.meminfo_path)
            .await
            .with_context(|| format!("reading {}", self.meminfo_path.display()))?;
        parse_meminfo(&content).context("MemTotal missing from meminfo")
    }
}
