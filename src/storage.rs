use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::error::MonitorError;

/// Flat-file state shared between runs.
///
/// Every record lives in its own JSON blob at `<root>/<kind>/<id>.json`, so a
/// damaged blob only affects the one source or metric it belongs to.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, MonitorError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn blob_path(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join(kind).join(format!("{}.json", id))
    }

    /// Read a record. A missing blob is `Ok(None)`: "never seen", not an error.
    pub fn load<T: DeserializeOwned>(&self, kind: &str, id: &str) -> Result<Option<T>, MonitorError> {
        let path = self.blob_path(kind, id);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| MonitorError::StateCorrupt { path, reason: e.to_string() })
    }

    /// Like [`load`](Self::load) but folds a corrupt or unreadable blob into
    /// "absent" after logging it. Returns the error so callers can report it.
    pub fn load_or_reseed<T: DeserializeOwned>(&self, kind: &str, id: &str) -> (Option<T>, Option<MonitorError>) {
        match self.load(kind, id) {
            Ok(v) => (v, None),
            Err(e) => {
                tracing::warn!(kind, id, error = %e, "Discarding unreadable state, reseeding");
                (None, Some(e))
            }
        }
    }

    /// Replace a record. The new blob is written beside the old one and
    /// renamed over it, so an interrupted write keeps the previous state.
    pub fn save<T: Serialize>(&self, kind: &str, id: &str, value: &T) -> Result<(), MonitorError> {
        let path = self.blob_path(kind, id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| MonitorError::Io(std::io::Error::new(ErrorKind::InvalidData, e)))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Stable identifier for a monitored path: `/var/log/syslog` -> `var_log_syslog`.
pub fn source_identifier(path: &str) -> String {
    if path == JOURNAL_SOURCE {
        return "systemd_journal".to_string();
    }
    path.trim_matches('/').replace('/', "_")
}

/// Pseudo source name for the systemd journal
pub const JOURNAL_SOURCE: &str = "systemd journal";
