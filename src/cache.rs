//! Latest-value store shared between the acquisition loop and readers.
//!
//! Values are replaced wholesale behind an [`Arc`], so a reader either sees
//! the previous snapshot or the new one and never a mix of the two. The
//! optional [`FileMirror`] publishes the same values as JSON files for
//! out-of-process consumers.

use crate::telemetry::{ServiceStatus, TelemetrySnapshot};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SNAPSHOT_FILE: &str = "bms_latest.json";
pub const STATUS_FILE: &str = "bms_status.json";

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed mirror file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Writes cache contents into a directory, one JSON file per value.
#[derive(Debug, Clone)]
pub struct FileMirror {
    dir: PathBuf,
}

impl FileMirror {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_snapshot(&self, snapshot: &TelemetrySnapshot) -> Result<(), MirrorError> {
        write_atomic(&self.dir.join(SNAPSHOT_FILE), snapshot)
    }

    pub fn write_status(&self, status: &ServiceStatus) -> Result<(), MirrorError> {
        write_atomic(&self.dir.join(STATUS_FILE), status)
    }
}

/// Serializes `value` next to `path` and renames it into place.
///
/// Readers of `path` observe either the old or the new content.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), MirrorError> {
    let io_err = |source: io::Error| MirrorError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    serde_json::to_writer_pretty(file.as_file_mut(), value).map_err(|source| {
        MirrorError::Json {
            path: path.to_path_buf(),
            source,
        }
    })?;
    file.as_file_mut().flush().map_err(io_err)?;
    file.persist(path).map_err(|err| io_err(err.error))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, MirrorError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(MirrorError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| MirrorError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Loads whatever a daemon last mirrored into `dir`.
pub fn read_mirror(
    dir: &Path,
) -> Result<(Option<TelemetrySnapshot>, Option<ServiceStatus>), MirrorError> {
    let snapshot = read_json(&dir.join(SNAPSHOT_FILE))?;
    let status = read_json(&dir.join(STATUS_FILE))?;
    Ok((snapshot, status))
}

pub struct SnapshotCache {
    snapshot: RwLock<Option<Arc<TelemetrySnapshot>>>,
    status: RwLock<Arc<ServiceStatus>>,
    mirror: Option<FileMirror>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(None),
            status: RwLock::new(Arc::new(ServiceStatus::default())),
            mirror: None,
        }
    }

    pub fn with_mirror(mirror: FileMirror) -> Self {
        Self {
            mirror: Some(mirror),
            ..Self::new()
        }
    }

    pub fn mirror(&self) -> Option<&FileMirror> {
        self.mirror.as_ref()
    }

    /// Publishes a validated snapshot. Mirror failures are logged, never returned.
    pub fn replace_snapshot(&self, snapshot: TelemetrySnapshot) {
        let snapshot = Arc::new(snapshot);
        *self.snapshot.write() = Some(Arc::clone(&snapshot));
        if let Some(mirror) = &self.mirror {
            if let Err(err) = mirror.write_snapshot(&snapshot) {
                log::error!("Failed to mirror snapshot: {err}");
            }
        }
    }

    /// Publishes the service status. An unchanged status is not rewritten.
    pub fn replace_status(&self, status: ServiceStatus) {
        let status = {
            let mut current = self.status.write();
            if **current == status {
                return;
            }
            *current = Arc::new(status);
            Arc::clone(&current)
        };
        if let Some(mirror) = &self.mirror {
            if let Err(err) = mirror.write_status(&status) {
                log::error!("Failed to mirror status: {err}");
            }
        }
    }

    /// Latest snapshot together with the status current at the time of the call.
    pub fn read(&self) -> (Option<Arc<TelemetrySnapshot>>, Arc<ServiceStatus>) {
        (self.snapshot(), self.status())
    }

    pub fn snapshot(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.snapshot.read().clone()
    }

    pub fn status(&self) -> Arc<ServiceStatus> {
        Arc::clone(&self.status.read())
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}
