use crate::{QuarryError, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;

pub const BACKUP_INFIX: &str = ".corrupt-backup.";

/// SQLite companion files that travel with the main database file.
pub const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

pub fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    append(db_path, suffix)
}

/// `YYYYMMDD-HHMMSS` in UTC.
pub fn backup_stamp() -> String {
    let format = format_description!("[year][month][day]-[hour][minute][second]");
    OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| "00000000-000000".to_string())
}

/// Copy the database and any present sidecars to
/// `{file}.corrupt-backup.{stamp}`. A numeric suffix is appended when that
/// stamp is already taken.
///
/// Returns the created paths, main database first. Nothing to copy yields an
/// empty list.
pub fn backup_database_files(db_path: &Path) -> Result<Vec<PathBuf>> {
    let mut sources: Vec<PathBuf> = Vec::new();
    if db_path.exists() {
        sources.push(db_path.to_path_buf());
    }
    for suffix in SIDECAR_SUFFIXES {
        let sidecar = sidecar_path(db_path, suffix);
        if sidecar.exists() {
            sources.push(sidecar);
        }
    }
    if sources.is_empty() {
        return Ok(Vec::new());
    }

    let stamp = unique_stamp(db_path, &backup_stamp());
    let mut created = Vec::with_capacity(sources.len());
    for source in sources {
        let target = append(&source, &format!("{BACKUP_INFIX}{stamp}"));
        fs::copy(&source, &target).map_err(|err| {
            QuarryError::BackupError(format!(
                "copy {} -> {}: {err}",
                source.display(),
                target.display()
            ))
        })?;
        created.push(target);
    }

    tracing::info!(db = %db_path.display(), count = created.len(), "database backup created");
    Ok(created)
}

fn unique_stamp(db_path: &Path, base: &str) -> String {
    let taken = |stamp: &str| {
        std::iter::once("")
            .chain(SIDECAR_SUFFIXES)
            .any(|suffix| append(db_path, &format!("{suffix}{BACKUP_INFIX}{stamp}")).exists())
    };
    if !taken(base) {
        return base.to_string();
    }
    let mut n = 1;
    loop {
        let candidate = format!("{base}.{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// True when `candidate` is a main-file backup of `db_path`.
pub fn is_backup_of(db_path: &Path, candidate: &Path) -> bool {
    backup_suffix(db_path, candidate).is_some()
}

fn backup_suffix(db_path: &Path, candidate: &Path) -> Option<String> {
    let db_name = db_path.file_name()?.to_str()?;
    let name = candidate.file_name()?.to_str()?;
    let stamp = name.strip_prefix(db_name)?.strip_prefix(BACKUP_INFIX)?;
    (!stamp.is_empty()).then(|| stamp.to_string())
}

/// Main-file backups of `db_path`, newest first.
pub fn list_backups(db_path: &Path) -> Result<Vec<PathBuf>> {
    let dir = parent_dir(db_path);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut backups: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_backup_of(db_path, path))
        .collect();
    backups.sort();
    backups.reverse();
    Ok(backups)
}

/// Delete the database file and its sidecars.
pub fn remove_database_files(db_path: &Path) -> Result<()> {
    for path in std::iter::once(db_path.to_path_buf())
        .chain(SIDECAR_SUFFIXES.iter().map(|s| sidecar_path(db_path, s)))
    {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Replace the live database with `backup_path`, including the sidecars that
/// were backed up alongside it. Live sidecars without a backed-up copy are
/// removed so SQLite does not replay a foreign WAL.
pub fn restore_database_files(backup_path: &Path, db_path: &Path) -> Result<()> {
    if !backup_path.is_file() {
        return Err(QuarryError::FileNotFound(backup_path.to_path_buf()));
    }
    let stamp = backup_suffix(db_path, backup_path);

    let tmp = append(db_path, ".restore-tmp");
    fs::copy(backup_path, &tmp)?;

    for suffix in SIDECAR_SUFFIXES {
        let live = sidecar_path(db_path, suffix);
        let backed_up = stamp
            .as_ref()
            .map(|stamp| append(&append(db_path, suffix), &format!("{BACKUP_INFIX}{stamp}")))
            .filter(|p| p.exists());
        match backed_up {
            Some(source) => {
                fs::copy(&source, &live)?;
            }
            None => match fs::remove_file(&live) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            },
        }
    }

    fs::rename(&tmp, db_path)?;
    tracing::info!(backup = %backup_path.display(), db = %db_path.display(), "database restored from backup");
    Ok(())
}

fn append(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}
