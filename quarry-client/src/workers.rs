//! Worker process registry
//!
//! Workers are plain OS processes. The only shared state is the registry
//! file `workers.json`, guarded by an exclusive lock on `workers.lock`.

use fs2::FileExt;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use quarry_core::safety::{now_rfc3339, write_atomic};
use quarry_core::{QuarryError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    Watcher,
    Vectorizer,
    Repair,
}

impl WorkerType {
    pub const ALL: [WorkerType; 3] = [Self::Watcher, Self::Vectorizer, Self::Repair];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Watcher => "watcher",
            Self::Vectorizer => "vectorizer",
            Self::Repair => "repair",
        }
    }
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerType {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "watcher" | "file_watcher" => Ok(Self::Watcher),
            "vectorizer" | "vectorization" => Ok(Self::Vectorizer),
            "repair" | "repair_worker" => Ok(Self::Repair),
            other => Err(QuarryError::InvalidRequest(format!("unknown worker type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub worker_type: WorkerType,
    pub pid: u32,
    pub start_time: String,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    #[serde(flatten)]
    pub entry: WorkerEntry,
    pub alive: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    workers: Vec<WorkerEntry>,
}

/// Command line used to launch a worker: `{program} {args..} worker run {type}`.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// The running executable, passing `config` through when given.
    pub fn current_exe(config: Option<&Path>) -> Result<Self> {
        let program = std::env::current_exe()?;
        let args = match config {
            Some(path) => vec!["--config".to_string(), path.to_string_lossy().to_string()],
            None => Vec::new(),
        };
        Ok(Self { program, args })
    }
}

pub struct WorkerRegistry {
    registry_path: PathBuf,
    lock_path: PathBuf,
    logs_dir: PathBuf,
    command: WorkerCommand,
    stop_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(data_dir: &Path, logs_dir: &Path, command: WorkerCommand, stop_timeout: Duration) -> Self {
        Self {
            registry_path: data_dir.join("workers.json"),
            lock_path: data_dir.join("workers.lock"),
            logs_dir: logs_dir.to_path_buf(),
            command,
            stop_timeout,
        }
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    /// Spawn a detached worker and record its pid.
    pub fn start(&self, worker_type: WorkerType) -> Result<WorkerEntry> {
        let _lock = self.lock()?;
        let mut registry = self.load()?;
        prune_dead(&mut registry);

        if let Some(existing) = registry.workers.iter().find(|w| w.worker_type == worker_type) {
            return Err(QuarryError::WorkerAlreadyRunning {
                worker_type: worker_type.to_string(),
                pid: existing.pid,
            });
        }

        std::fs::create_dir_all(&self.logs_dir)?;
        let log_path = self.logs_dir.join(format!("{}.log", worker_type));
        let log_out = OpenOptions::new().create(true).append(true).open(&log_path)?;
        let log_err = log_out.try_clone()?;

        let child = Command::new(&self.command.program)
            .args(&self.command.args)
            .args(["worker", "run", worker_type.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_out))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()?;

        let entry = WorkerEntry {
            worker_type,
            pid: child.id(),
            start_time: now_rfc3339(),
            log_path,
        };
        drop(child);
        registry.workers.push(entry.clone());
        self.save(&registry)?;
        tracing::info!(worker = %worker_type, pid = entry.pid, log = %entry.log_path.display(), "worker started");
        Ok(entry)
    }

    /// SIGTERM, then SIGKILL after the stop timeout. The entry is removed
    /// either way. Returns whether a live process was signalled.
    pub fn stop(&self, worker_type: WorkerType) -> Result<bool> {
        let _lock = self.lock()?;
        let mut registry = self.load()?;
        let Some(index) = registry.workers.iter().position(|w| w.worker_type == worker_type) else {
            return Ok(false);
        };
        let entry = registry.workers.remove(index);
        let signalled = terminate(entry.pid, self.stop_timeout);
        self.save(&registry)?;
        tracing::info!(worker = %worker_type, pid = entry.pid, signalled, "worker stopped");
        Ok(signalled)
    }

    /// Stop every registered worker; returns the types that were running.
    pub fn stop_all(&self) -> Result<Vec<WorkerType>> {
        let _lock = self.lock()?;
        let registry = self.load()?;
        let mut stopped = Vec::new();
        for entry in &registry.workers {
            if terminate(entry.pid, self.stop_timeout) {
                stopped.push(entry.worker_type);
            }
        }
        self.save(&RegistryFile::default())?;
        if !stopped.is_empty() {
            tracing::warn!(workers = ?stopped, "stopped all workers");
        }
        Ok(stopped)
    }

    pub fn status(&self) -> Result<Vec<WorkerStatus>> {
        let _lock = self.lock()?;
        let registry = self.load()?;
        Ok(registry
            .workers
            .into_iter()
            .map(|entry| {
                let alive = is_alive(entry.pid);
                WorkerStatus { entry, alive }
            })
            .collect())
    }

    fn lock(&self) -> Result<RegistryLock> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(RegistryLock { file })
    }

    fn load(&self) -> Result<RegistryFile> {
        match std::fs::read(&self.registry_path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(RegistryFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, registry: &RegistryFile) -> Result<()> {
        write_atomic(&self.registry_path, &serde_json::to_vec_pretty(registry)?)
    }
}

struct RegistryLock {
    file: File,
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn prune_dead(registry: &mut RegistryFile) {
    registry.workers.retain(|entry| {
        let alive = is_alive(entry.pid);
        if !alive {
            tracing::debug!(worker = %entry.worker_type, pid = entry.pid, "pruning dead worker entry");
        }
        alive
    });
}

fn is_alive(pid: u32) -> bool {
    let pid = Pid::from_raw(pid as i32);
    // Reap it first if it is our own exited child, so a zombie does not count.
    if let Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) = waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        return false;
    }
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn terminate(pid: u32, timeout: Duration) -> bool {
    if !is_alive(pid) {
        return false;
    }
    let target = Pid::from_raw(pid as i32);
    let _ = kill(target, Signal::SIGTERM);

    let start = Instant::now();
    while start.elapsed() < timeout {
        if !is_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    tracing::warn!(pid, "worker ignored SIGTERM, killing");
    let _ = kill(target, Signal::SIGKILL);
    let deadline = Instant::now() + Duration::from_secs(2);
    while is_alive(pid) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &Path, script: &str) -> WorkerRegistry {
        // `sh -c script worker run <type>`: the trailing words become $0.. and are ignored.
        let command = WorkerCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
        };
        WorkerRegistry::new(dir, &dir.join("logs"), command, Duration::from_secs(2))
    }

    #[test]
    fn worker_type_names_roundtrip() {
        for worker in WorkerType::ALL {
            assert_eq!(worker.as_str().parse::<WorkerType>().unwrap(), worker);
        }
        assert!("indexer".parse::<WorkerType>().is_err());
    }

    #[test]
    fn start_refuses_duplicate_and_stop_removes_entry() {
        let dir = TempDir::new().unwrap();
        let registry = registry(dir.path(), "exec sleep 30");

        let entry = registry.start(WorkerType::Watcher).unwrap();
        assert!(entry.log_path.ends_with("watcher.log"));
        assert!(is_alive(entry.pid));

        let err = registry.start(WorkerType::Watcher).unwrap_err();
        assert!(matches!(err, QuarryError::WorkerAlreadyRunning { pid, .. } if pid == entry.pid));

        assert!(registry.stop(WorkerType::Watcher).unwrap());
        assert!(!is_alive(entry.pid));
        assert!(registry.status().unwrap().is_empty());
        assert!(!registry.stop(WorkerType::Watcher).unwrap());
    }

    #[test]
    fn dead_entries_are_pruned_on_start() {
        let dir = TempDir::new().unwrap();
        let registry = registry(dir.path(), "exit 0");

        let first = registry.start(WorkerType::Repair).unwrap();
        let start = Instant::now();
        while is_alive(first.pid) && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(20));
        }
        let second = registry.start(WorkerType::Repair).unwrap();
        assert_ne!(first.pid, second.pid);
        let status = registry.status().unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].entry.pid, second.pid);
    }

    #[test]
    fn stop_all_clears_registry() {
        let dir = TempDir::new().unwrap();
        let registry = registry(dir.path(), "exec sleep 30");
        registry.start(WorkerType::Watcher).unwrap();
        registry.start(WorkerType::Vectorizer).unwrap();

        let mut stopped = registry.stop_all().unwrap();
        stopped.sort_by_key(|w| w.as_str());
        assert_eq!(stopped, vec![WorkerType::Vectorizer, WorkerType::Watcher]);
        assert!(registry.status().unwrap().is_empty());
    }
}
