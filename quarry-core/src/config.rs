//! Configuration for quarry

use crate::QuarryError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "QUARRY_CONFIG";

/// Default config file name, looked up in the current directory
pub const DEFAULT_CONFIG_FILE: &str = "quarry.toml";

/// Default configuration as TOML
pub const DEFAULT_CONFIG: &str = r#"# Quarry Configuration

[database]
# The single SQLite file owned by quarry-driver. Relative paths resolve
# against the directory holding this file.
path = "data/quarry.db"
busy_timeout_ms = 5000

[driver]
bind = "127.0.0.1"
port = 4815
# Pending RPCs queued for the executor thread
queue_capacity = 256
# Explicit transactions idle longer than this are rolled back
transaction_timeout = "30s"
# A successful integrity probe is trusted for this long
integrity_probe_interval = "5m"
# Legacy submit/poll protocol limits
max_pending_jobs = 1024
job_retention = "10m"

[client]
driver_url = "http://127.0.0.1:4815"
max_retries = 5
retry_base_delay = "100ms"
retry_max_delay = "2s"
poll_interval = "200ms"
poll_timeout = "5m"
# Empty means no client-side timeout
request_timeout = ""

[indexing]
extensions = ["py"]
project_marker = "projectid"
max_file_bytes = 2000000
ignore_patterns = [
    ".git",
    ".hg",
    ".svn",
    "__pycache__",
    "node_modules",
    ".venv",
    "venv",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    "build",
    "dist",
    "target",
    "logs",
    "*.log",
]

[workers]
watch_dirs = []
watch_interval = "30s"
stop_timeout = "10s"
repair_poll_interval = "60s"
repair_batch_size = 50
version_root = "data/versions"

[vectorize]
embedding_url = "http://127.0.0.1:8001/embed"
model = "all-MiniLM-L6-v2"
dimension = 384
batch_size = 32
poll_interval = "30s"
rebuild_interval = "10m"
# Chunks the provider rejected this many times are no longer retried
max_embedding_attempts = 3
"#;

/// Quarry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub vectorize: VectorizeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout: String,
    #[serde(default = "default_integrity_probe_interval")]
    pub integrity_probe_interval: String,
    #[serde(default = "default_max_pending_jobs")]
    pub max_pending_jobs: usize,
    #[serde(default = "default_job_retention")]
    pub job_retention: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_driver_url")]
    pub driver_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay: String,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: String,
    #[serde(default)]
    pub request_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_project_marker")]
    pub project_marker: String,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default)]
    pub watch_dirs: Vec<PathBuf>,
    #[serde(default = "default_watch_interval")]
    pub watch_interval: String,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: String,
    #[serde(default = "default_repair_poll_interval")]
    pub repair_poll_interval: String,
    #[serde(default = "default_repair_batch_size")]
    pub repair_batch_size: usize,
    #[serde(default = "default_version_root")]
    pub version_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorizeConfig {
    #[serde(default = "default_embedding_url")]
    pub embedding_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default = "default_vectorize_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_vectorize_poll_interval")]
    pub poll_interval: String,
    #[serde(default = "default_rebuild_interval")]
    pub rebuild_interval: String,
    #[serde(default = "default_max_embedding_attempts")]
    pub max_embedding_attempts: u32,
}

// Default value functions
fn default_db_path() -> PathBuf {
    PathBuf::from("data/quarry.db")
}
fn default_busy_timeout_ms() -> u64 {
    5000
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4815
}
fn default_queue_capacity() -> usize {
    256
}
fn default_transaction_timeout() -> String {
    "30s".to_string()
}
fn default_integrity_probe_interval() -> String {
    "5m".to_string()
}
fn default_max_pending_jobs() -> usize {
    1024
}
fn default_job_retention() -> String {
    "10m".to_string()
}
fn default_driver_url() -> String {
    "http://127.0.0.1:4815".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_delay() -> String {
    "100ms".to_string()
}
fn default_retry_max_delay() -> String {
    "2s".to_string()
}
fn default_poll_interval() -> String {
    "200ms".to_string()
}
fn default_poll_timeout() -> String {
    "5m".to_string()
}
fn default_extensions() -> Vec<String> {
    vec!["py".to_string()]
}
fn default_project_marker() -> String {
    "projectid".to_string()
}
fn default_max_file_bytes() -> u64 {
    2_000_000
}
fn default_ignore_patterns() -> Vec<String> {
    [
        ".git",
        ".hg",
        ".svn",
        "__pycache__",
        "node_modules",
        ".venv",
        "venv",
        ".tox",
        ".mypy_cache",
        ".pytest_cache",
        "build",
        "dist",
        "target",
        "logs",
        "*.log",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_watch_interval() -> String {
    "30s".to_string()
}
fn default_stop_timeout() -> String {
    "10s".to_string()
}
fn default_repair_poll_interval() -> String {
    "60s".to_string()
}
fn default_repair_batch_size() -> usize {
    50
}
fn default_version_root() -> PathBuf {
    PathBuf::from("data/versions")
}
fn default_embedding_url() -> String {
    "http://127.0.0.1:8001/embed".to_string()
}
fn default_model() -> String {
    "all-MiniLM-L6-v2".to_string()
}
fn default_dimension() -> usize {
    384
}
fn default_vectorize_batch_size() -> usize {
    32
}
fn default_vectorize_poll_interval() -> String {
    "30s".to_string()
}
fn default_rebuild_interval() -> String {
    "10m".to_string()
}
fn default_max_embedding_attempts() -> u32 {
    3
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            queue_capacity: default_queue_capacity(),
            transaction_timeout: default_transaction_timeout(),
            integrity_probe_interval: default_integrity_probe_interval(),
            max_pending_jobs: default_max_pending_jobs(),
            job_retention: default_job_retention(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            driver_url: default_driver_url(),
            max_retries: default_max_retries(),
            retry_base_delay: default_retry_base_delay(),
            retry_max_delay: default_retry_max_delay(),
            poll_interval: default_poll_interval(),
            poll_timeout: default_poll_timeout(),
            request_timeout: String::new(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            project_marker: default_project_marker(),
            max_file_bytes: default_max_file_bytes(),
            ignore_patterns: default_ignore_patterns(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            watch_dirs: Vec::new(),
            watch_interval: default_watch_interval(),
            stop_timeout: default_stop_timeout(),
            repair_poll_interval: default_repair_poll_interval(),
            repair_batch_size: default_repair_batch_size(),
            version_root: default_version_root(),
        }
    }
}

impl Default for VectorizeConfig {
    fn default() -> Self {
        Self {
            embedding_url: default_embedding_url(),
            model: default_model(),
            dimension: default_dimension(),
            batch_size: default_vectorize_batch_size(),
            poll_interval: default_vectorize_poll_interval(),
            rebuild_interval: default_rebuild_interval(),
            max_embedding_attempts: default_max_embedding_attempts(),
        }
    }
}

impl Config {
    /// Load config from a TOML file; relative paths resolve against its directory.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)?;
        let path = absolute_path(path)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Locate and load the config: explicit path, then `$QUARRY_CONFIG`, then
    /// `./quarry.toml`, falling back to defaults rooted at the working
    /// directory. Paths in the result are absolute.
    pub fn discover(explicit: Option<&Path>) -> crate::Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::load(local);
        }
        let mut config = Self::default();
        config.resolve_paths(&std::env::current_dir()?);
        Ok(config)
    }

    /// Parse config from TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| QuarryError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject duration strings that do not parse.
    fn validate(&self) -> crate::Result<()> {
        let durations = [
            ("driver.transaction_timeout", &self.driver.transaction_timeout),
            ("driver.integrity_probe_interval", &self.driver.integrity_probe_interval),
            ("driver.job_retention", &self.driver.job_retention),
            ("client.retry_base_delay", &self.client.retry_base_delay),
            ("client.retry_max_delay", &self.client.retry_max_delay),
            ("client.poll_interval", &self.client.poll_interval),
            ("client.poll_timeout", &self.client.poll_timeout),
            ("workers.watch_interval", &self.workers.watch_interval),
            ("workers.stop_timeout", &self.workers.stop_timeout),
            ("workers.repair_poll_interval", &self.workers.repair_poll_interval),
            ("vectorize.poll_interval", &self.vectorize.poll_interval),
            ("vectorize.rebuild_interval", &self.vectorize.rebuild_interval),
        ];
        for (key, value) in durations {
            if parse_duration(value).is_none() {
                return Err(QuarryError::ConfigParse(format!("{key}: invalid duration {value:?}")));
            }
        }
        // Empty means no timeout.
        if !self.client.request_timeout.trim().is_empty() && self.client.request_timeout().is_none() {
            return Err(QuarryError::ConfigParse(format!(
                "client.request_timeout: invalid duration {:?}",
                self.client.request_timeout
            )));
        }
        Ok(())
    }

    /// Config rooted at `data_dir`, used by tests and single-directory setups.
    pub fn with_data_dir(data_dir: &Path) -> Self {
        let mut config = Self::default();
        config.database.path = data_dir.join("quarry.db");
        config.workers.version_root = data_dir.join("versions");
        config
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.database.path.is_relative() {
            self.database.path = base.join(&self.database.path);
        }
        if self.workers.version_root.is_relative() {
            self.workers.version_root = base.join(&self.workers.version_root);
        }
        for dir in &mut self.workers.watch_dirs {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }

    /// Directory holding the database and every filesystem artefact next to it
    pub fn data_dir(&self) -> PathBuf {
        match self.database.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir().join("workers.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn vectors_dir(&self) -> PathBuf {
        self.data_dir().join("vectors")
    }
}

impl DriverConfig {
    pub fn transaction_timeout(&self) -> Duration {
        parse_duration(&self.transaction_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn integrity_probe_interval(&self) -> Duration {
        parse_duration(&self.integrity_probe_interval).unwrap_or(Duration::from_secs(300))
    }

    pub fn job_retention(&self) -> Duration {
        parse_duration(&self.job_retention).unwrap_or(Duration::from_secs(600))
    }
}

impl ClientConfig {
    pub fn retry_base_delay(&self) -> Duration {
        parse_duration(&self.retry_base_delay).unwrap_or(Duration::from_millis(100))
    }

    pub fn retry_max_delay(&self) -> Duration {
        parse_duration(&self.retry_max_delay).unwrap_or(Duration::from_secs(2))
    }

    pub fn poll_interval(&self) -> Duration {
        parse_duration(&self.poll_interval).unwrap_or(Duration::from_millis(200))
    }

    pub fn poll_timeout(&self) -> Duration {
        parse_duration(&self.poll_timeout).unwrap_or(Duration::from_secs(300))
    }

    /// `None` means the client waits for the driver indefinitely.
    pub fn request_timeout(&self) -> Option<Duration> {
        parse_duration(&self.request_timeout)
    }
}

impl WorkersConfig {
    pub fn watch_interval(&self) -> Duration {
        parse_duration(&self.watch_interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn stop_timeout(&self) -> Duration {
        parse_duration(&self.stop_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn repair_poll_interval(&self) -> Duration {
        parse_duration(&self.repair_poll_interval).unwrap_or(Duration::from_secs(60))
    }
}

impl VectorizeConfig {
    pub fn poll_interval(&self) -> Duration {
        parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn rebuild_interval(&self) -> Duration {
        parse_duration(&self.rebuild_interval).unwrap_or(Duration::from_secs(600))
    }
}

/// Parse duration string (e.g., "250ms", "30s", "5m", "1h", "1d")
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(num_str) = s.strip_suffix("ms") {
        return num_str.parse().ok().map(Duration::from_millis);
    }

    let (split, unit) = s.char_indices().last()?;
    let num: u64 = s[..split].parse().ok()?;

    let scale = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86400,
        _ => return None,
    };
    num.checked_mul(scale).map(Duration::from_secs)
}

/// `path` joined onto the working directory when relative.
pub fn absolute_path(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let config = Config::from_toml(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.driver.port, 4815);
        assert_eq!(config.indexing.extensions, vec!["py".to_string()]);
        assert_eq!(config.indexing.ignore_patterns, default_ignore_patterns());
        assert_eq!(config.client.request_timeout(), None);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("2d"), Some(Duration::from_secs(172800)));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("invalid"), None);
        assert_eq!(parse_duration("5µ"), None);
        assert_eq!(parse_duration("µ"), None);
        assert_eq!(parse_duration(&format!("{}d", u64::MAX)), None);
    }

    #[test]
    fn test_invalid_duration_is_a_config_error() {
        let err = Config::from_toml("[workers]\nwatch_interval = \"5µ\"\n").unwrap_err();
        assert!(matches!(err, QuarryError::ConfigParse(ref msg) if msg.contains("workers.watch_interval")));
        assert!(Config::from_toml("[client]\nrequest_timeout = \"soon\"\n").is_err());
        assert!(Config::from_toml("[client]\nrequest_timeout = \"\"\n").is_ok());
    }

    #[test]
    fn test_relative_config_path_yields_absolute_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("quarry.toml"), "[database]\npath = \"data/index.db\"\n").unwrap();
        let relative = relative_to_cwd(dir.path());
        let config = Config::load(&relative.join("quarry.toml")).unwrap();
        assert!(config.database.path.is_absolute());
        assert!(config.workers.version_root.is_absolute());
        assert!(config.database.path.ends_with("data/index.db"));
    }

    // `dir` spelled relative to the working directory via `..` segments.
    fn relative_to_cwd(dir: &Path) -> PathBuf {
        let cwd = std::env::current_dir().unwrap();
        let mut relative = PathBuf::new();
        for _ in cwd.components().skip(1) {
            relative.push("..");
        }
        relative.join(dir.strip_prefix("/").unwrap())
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("quarry.toml");
        std::fs::write(
            &path,
            "[database]\npath = \"db/index.db\"\n[workers]\nwatch_dirs = [\"src\"]\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.database.path, dir.path().join("db/index.db"));
        assert_eq!(config.data_dir(), dir.path().join("db"));
        assert_eq!(config.workers.watch_dirs, vec![dir.path().join("src")]);
        assert_eq!(config.registry_path(), dir.path().join("db/workers.json"));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = Config::from_toml("[driver]\nport = 9000\n").unwrap();
        assert_eq!(config.driver.port, 9000);
        assert_eq!(config.driver.transaction_timeout(), Duration::from_secs(30));
        assert_eq!(config.workers.repair_batch_size, 50);
    }
}
