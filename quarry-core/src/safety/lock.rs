use crate::{QuarryError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Exclusive advisory lock serializing repair and restore.
///
/// The lock file `{db}.repair.lock` is left in place; only the OS lock
/// matters. Released on drop.
#[derive(Debug)]
pub struct RepairLock {
    file: File,
    path: PathBuf,
}

impl RepairLock {
    pub fn path_for(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_os_string();
        name.push(".repair.lock");
        PathBuf::from(name)
    }

    /// Non-blocking acquire. A held lock is reported as a repair error.
    pub fn try_acquire(db_path: &Path) -> Result<Self> {
        let path = Self::path_for(db_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(QuarryError::repair("repair already in progress", Vec::new()));
        }
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepairLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
