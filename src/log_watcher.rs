use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::error::{Diagnostic, MonitorError};
use crate::storage::StateDir;

const POSITIONS: &str = "positions";

/// Filesystem identity of a log file, stable across process restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl SourceIdentity {
    pub fn resolve(path: &Path) -> Result<Self, MonitorError> {
        let meta = std::fs::metadata(path).map_err(|e| MonitorError::source_unavailable(path, e))?;
        Ok(Self::from_metadata(&meta))
    }

    fn from_metadata(meta: &std::fs::Metadata) -> Self {
        Self { dev: meta.dev(), ino: meta.ino() }
    }
}

/// Persisted read position of one log source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub identifier: String,
    pub device_inode: SourceIdentity,
    pub offset_lines: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    /// No stored record for this source
    FirstSight,
    /// Stored identity differs from the file now at the path
    Rotated,
    /// Same file, read past the stored offset
    Appended,
    /// Same file but shorter than the stored offset
    Truncated,
}

impl DiffKind {
    /// Whole-file reads that must not feed the volume baseline
    pub fn is_discovery(self) -> bool {
        matches!(self, DiffKind::FirstSight | DiffKind::Rotated)
    }
}

#[derive(Debug, Clone)]
pub struct LogDiff {
    /// Lines past the stored offset; left empty by [`count_diff`]
    pub new_lines: Vec<String>,
    pub new_line_count: u64,
    pub updated: SourceRecord,
    pub kind: DiffKind,
}

/// Return the lines appended to `path` since `previous` was recorded.
///
/// On first sight or rotation the whole file is returned. A file that shrank
/// without changing identity is treated as truncated: the offset is reset and
/// nothing is returned. Errors leave `previous` untouched.
pub fn read_diff(path: &Path, identifier: &str, previous: Option<&SourceRecord>) -> Result<LogDiff, MonitorError> {
    scan(path, identifier, previous, true)
}

/// Same as [`read_diff`] but only counts the new lines, so discovering a
/// large file does not hold it in memory.
pub fn count_diff(path: &Path, identifier: &str, previous: Option<&SourceRecord>) -> Result<LogDiff, MonitorError> {
    scan(path, identifier, previous, false)
}

fn scan(path: &Path, identifier: &str, previous: Option<&SourceRecord>, keep_lines: bool) -> Result<LogDiff, MonitorError> {
    let file = File::open(path).map_err(|e| MonitorError::source_unavailable(path, e))?;
    let meta = file.metadata().map_err(|e| MonitorError::source_unavailable(path, e))?;
    let current = SourceIdentity::from_metadata(&meta);

    let (kind, skip) = match previous {
        None => (DiffKind::FirstSight, 0),
        Some(prev) if prev.device_inode != current => (DiffKind::Rotated, 0),
        Some(prev) => (DiffKind::Appended, prev.offset_lines),
    };

    let (total, mut new_lines) = read_lines_after(BufReader::new(file), skip, keep_lines)
        .map_err(|e| MonitorError::source_unavailable(path, e))?;

    let (kind, new_line_count) = if kind == DiffKind::Appended && total < skip {
        new_lines.clear();
        (DiffKind::Truncated, 0)
    } else {
        (kind, total - skip)
    };

    Ok(LogDiff {
        new_lines,
        new_line_count,
        updated: SourceRecord {
            identifier: identifier.to_string(),
            device_inode: current,
            offset_lines: total,
        },
        kind,
    })
}

/// Count every line and, with `keep`, collect the ones at index >= `skip`.
/// A trailing line without a newline still counts.
fn read_lines_after(mut reader: impl BufRead, skip: u64, keep: bool) -> std::io::Result<(u64, Vec<String>)> {
    let mut buf = Vec::new();
    let mut total = 0u64;
    let mut lines = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        if keep && total >= skip {
            let line = String::from_utf8_lossy(&buf);
            lines.push(line.trim_end_matches(&['\n', '\r'][..]).to_string());
        }
        total += 1;
    }

    Ok((total, lines))
}

/// Per-source read positions, loaded on first use and written back by
/// [`flush`](Self::flush) at the end of a run.
pub struct LogPositionStore {
    state: StateDir,
    pending: HashMap<String, SourceRecord>,
    diagnostics: Vec<Diagnostic>,
}

impl LogPositionStore {
    pub fn new(state: StateDir) -> Self {
        Self { state, pending: HashMap::new(), diagnostics: Vec::new() }
    }

    /// Stored record for `identifier`; corrupt records read as absent.
    pub fn load(&mut self, identifier: &str) -> Option<SourceRecord> {
        if let Some(rec) = self.pending.get(identifier) {
            return Some(rec.clone());
        }
        let (rec, err) = self.state.load_or_reseed::<SourceRecord>(POSITIONS, identifier);
        if let Some(e) = err {
            self.diagnostics.push(Diagnostic::new(identifier, &e));
        }
        rec
    }

    pub fn save(&mut self, identifier: &str, record: SourceRecord) {
        self.pending.insert(identifier.to_string(), record);
    }

    pub fn flush(&mut self) -> Vec<Diagnostic> {
        let mut failed = Vec::new();
        for (id, rec) in self.pending.drain() {
            if let Err(e) = self.state.save(POSITIONS, &id, &rec) {
                tracing::warn!(source = %id, error = %e, "Failed to persist log position");
                failed.push(Diagnostic::new(id, &e));
            }
        }
        failed
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }
}
