use crate::{QuarryError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// `{db}.corruption-marker.json` next to the database file.
pub fn marker_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(".corruption-marker.json");
    PathBuf::from(name)
}

/// Persistent proof that the database was observed corrupt.
///
/// The marker is sticky: once written it survives driver restarts and only
/// an explicit successful repair or restore removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorruptionMarker {
    pub message: String,
    #[serde(default)]
    pub backup_paths: Vec<PathBuf>,
    pub timestamp: String,
}

impl CorruptionMarker {
    pub fn new(message: impl Into<String>, backup_paths: Vec<PathBuf>) -> Self {
        Self {
            message: message.into(),
            backup_paths,
            timestamp: now_rfc3339(),
        }
    }

    pub fn exists(db_path: &Path) -> bool {
        marker_path(db_path).exists()
    }

    /// Read the marker; `None` when absent.
    ///
    /// A marker that exists but cannot be decoded still counts as present.
    pub fn read(db_path: &Path) -> Result<Option<Self>> {
        let path = marker_path(db_path);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str(&content) {
            Ok(marker) => Ok(Some(marker)),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "unreadable corruption marker");
                Ok(Some(Self {
                    message: format!("unreadable corruption marker: {err}"),
                    backup_paths: Vec::new(),
                    timestamp: String::new(),
                }))
            }
        }
    }

    /// Write the marker for `db_path`, keeping the first recorded message and
    /// accumulating backup paths if a marker is already present.
    pub fn record(db_path: &Path, message: &str, backup_paths: &[PathBuf]) -> Result<Self> {
        let marker = match Self::read(db_path)? {
            Some(mut existing) => {
                for path in backup_paths {
                    if !existing.backup_paths.contains(path) {
                        existing.backup_paths.push(path.clone());
                    }
                }
                existing
            }
            None => Self::new(message, backup_paths.to_vec()),
        };
        marker.write(db_path)?;
        Ok(marker)
    }

    /// Atomic write: temp file in the same directory, fsync, rename.
    pub fn write(&self, db_path: &Path) -> Result<()> {
        let path = marker_path(db_path);
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(&path, &json)?;
        tracing::warn!(path = %path.display(), message = %self.message, "corruption marker written");
        Ok(())
    }

    /// Remove the marker. Returns whether one was present.
    pub fn clear(db_path: &Path) -> Result<bool> {
        let path = marker_path(db_path);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "corruption marker cleared");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Write via a temp file in the same directory, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| QuarryError::InvalidRequest(format!("not a file path: {}", path.display())))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(format!(".tmp.{}", std::process::id()));
    let tmp_path = dir.join(tmp_name);

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}
