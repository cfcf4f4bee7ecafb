use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Endpoints that must always be attempted live.
pub const DEFAULT_EXCLUDED_ENDPOINTS: [&str; 6] = [
  "/login",
  "/register",
  "/refresh-token",
  "/request-reset-password",
  "/confirm-reset-password",
  "/verify-password-reset-token",
];

/// Marker placed in front of every placeholder identifier.
pub const DEFAULT_ID_PREFIX: &str = "offline";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub offline: OfflineConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Base url that relative request urls are resolved against
  pub url: String,
  /// Path probed to decide whether the server is reachable
  #[serde(default = "default_health_path")]
  pub health_path: String,
  #[serde(default = "default_probe_timeout_secs")]
  pub probe_timeout_secs: u64,
}

fn default_health_path() -> String {
  "/".to_string()
}

fn default_probe_timeout_secs() -> u64 {
  5
}

#[derive(Debug, Clone, Deserialize)]
pub struct OfflineConfig {
  /// Prefix of placeholder identifiers
  #[serde(default = "default_id_prefix")]
  pub id_prefix: String,
  /// Url suffixes that are never queued (authentication and session endpoints)
  #[serde(default = "default_excluded_endpoints")]
  pub excluded_endpoints: Vec<String>,
  /// Rewrite placeholders only where they are a whole value, not any substring
  #[serde(default)]
  pub strict_dependencies: bool,
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self {
      id_prefix: default_id_prefix(),
      excluded_endpoints: default_excluded_endpoints(),
      strict_dependencies: false,
    }
  }
}

fn default_id_prefix() -> String {
  DEFAULT_ID_PREFIX.to_string()
}

fn default_excluded_endpoints() -> Vec<String> {
  DEFAULT_EXCLUDED_ENDPOINTS
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Per-attempt timeout for a replayed request
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  /// Delay before the first retry; doubles on every further retry
  #[serde(default = "default_retry_backoff_ms")]
  pub retry_backoff_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      request_timeout_secs: default_request_timeout_secs(),
      max_attempts: default_max_attempts(),
      retry_backoff_ms: default_retry_backoff_ms(),
    }
  }
}

impl SyncConfig {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn retry_backoff(&self) -> Duration {
    Duration::from_millis(self.retry_backoff_ms)
  }
}

fn default_request_timeout_secs() -> u64 {
  30
}

fn default_max_attempts() -> u32 {
  3
}

fn default_retry_backoff_ms() -> u64 {
  500
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Queue database (default: $XDG_DATA_HOME/offsync/queue.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Filter directive used when OFFSYNC_LOG is not set
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Directory for log files (default: $XDG_DATA_HOME/offsync/logs)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;

    if config.offline.id_prefix.trim().is_empty() {
      return Err(eyre!("offline.id_prefix must not be empty"));
    }
    if config.sync.max_attempts == 0 {
      return Err(eyre!("sync.max_attempts must be at least 1"));
    }

    Ok(config)
  }

  /// Get the API token from the environment, if one is set.
  ///
  /// Checks OFFSYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("OFFSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
