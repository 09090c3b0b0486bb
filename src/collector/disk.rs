use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::statvfs::statvfs;
use std::path::{Path, PathBuf};

use crate::types::MetricKind;
use super::Collector;

/// Collects usage of the filesystem holding `mount`
pub struct DiskCollector {
    mount: PathBuf,
}

impl DiskCollector {
    pub fn new(mount: &Path) -> Self {
        Self { mount: mount.to_path_buf() }
    }
}

/// Used space as seen by unprivileged users, like `df`:
/// used / (used + available), where used excludes only free blocks.
fn usage_percent(blocks: u64, free: u64, available: u64) -> Option<f64> {
    let used = blocks.saturating_sub(free);
    let denom = used + available;
    if denom == 0 {
        return None;
    }
    Some(100.0 * used as f64 / denom as f64)
}

#[async_trait]
impl Collector for DiskCollector {
    fn name(&self) -> &str { "disk" }

    fn metric(&self) -> MetricKind { MetricKind::Disk }

    async fn collect(&mut self) -> Result<f64> {
        let stat = statvfs(self.mount.as_path())
            .with_context(|| format!("statvfs {}", self.mount.display()))?;

        usage_percent(
            stat.blocks() as u64,
            stat.blocks_free() as u64,
            stat.blocks_available() as u64,
        )
        .with_context(|| format!("{} reports no blocks", self.mount.display()))
    }
}
