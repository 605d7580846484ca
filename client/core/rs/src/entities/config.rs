use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::logger::{LogConfig, LogLevel, StdioLogMode};

/// Core controller configuration. Resolved once at startup from an
/// optional TOML file with `TRELLIS_*` environment overrides layered
/// on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
  /// Ip the websocket server binds to.
  #[serde(default = "default_bind_ip")]
  pub bind_ip: String,

  #[serde(default = "default_port")]
  pub port: u16,

  /// IANA timezone used for cron schedules without one of their own.
  /// Empty means the system local timezone.
  #[serde(default)]
  pub timezone: String,

  #[serde(default)]
  pub store: StoreConfig,

  /// Terminal tasks older than this many hours are swept.
  #[serde(default = "default_keep_tasks_for_hours")]
  pub keep_tasks_for_hours: u64,

  /// Max deletes per cleanup batch.
  #[serde(default = "default_cleanup_batch_size")]
  pub cleanup_batch_size: usize,

  /// Seconds without a heartbeat before an agent is marked
  /// unreachable.
  #[serde(default = "default_agent_stale_after")]
  pub agent_stale_after: u64,

  #[serde(default)]
  pub logging: LogConfig,

  /// Pretty-print the sanitized config at startup.
  #[serde(default)]
  pub pretty_startup_config: bool,
}

fn default_bind_ip() -> String {
  String::from("0.0.0.0")
}

fn default_port() -> u16 {
  9120
}

fn default_keep_tasks_for_hours() -> u64 {
  24
}

fn default_cleanup_batch_size() -> usize {
  100
}

fn default_agent_stale_after() -> u64 {
  180
}

impl Default for CoreConfig {
  fn default() -> CoreConfig {
    CoreConfig {
      bind_ip: default_bind_ip(),
      port: default_port(),
      timezone: String::new(),
      store: Default::default(),
      keep_tasks_for_hours: default_keep_tasks_for_hours(),
      cleanup_batch_size: default_cleanup_batch_size(),
      agent_stale_after: default_agent_stale_after(),
      logging: Default::default(),
      pretty_startup_config: false,
    }
  }
}

impl CoreConfig {
  /// Copy with credentials scrubbed, safe for the startup log.
  pub fn sanitized(&self) -> CoreConfig {
    let mut config = self.clone();
    if !config.store.password.is_empty() {
      config.store.password = String::from("***");
    }
    config
  }
}

/// Document store connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
  /// Base url of the store's HTTP API.
  #[serde(default = "default_store_uri")]
  pub uri: String,

  #[serde(default = "default_store_db_name")]
  pub db_name: String,

  #[serde(default)]
  pub username: String,

  #[serde(default)]
  pub password: String,

  /// Run against the embedded in-memory store instead of the HTTP
  /// API. Single node dev mode only: nothing survives a restart.
  #[serde(default)]
  pub memory: bool,
}

fn default_store_uri() -> String {
  String::from("http://127.0.0.1:5984")
}

fn default_store_db_name() -> String {
  String::from("trellis")
}

impl Default for StoreConfig {
  fn default() -> StoreConfig {
    StoreConfig {
      uri: default_store_uri(),
      db_name: default_store_db_name(),
      username: String::new(),
      password: String::new(),
      memory: false,
    }
  }
}

/// `TRELLIS_*` environment overrides, parsed with `envy`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Env {
  pub trellis_config_path: Option<PathBuf>,
  pub trellis_bind_ip: Option<String>,
  pub trellis_port: Option<u16>,
  pub trellis_timezone: Option<String>,
  pub trellis_store_uri: Option<String>,
  pub trellis_store_db_name: Option<String>,
  pub trellis_store_username: Option<String>,
  pub trellis_store_password: Option<String>,
  pub trellis_store_memory: Option<bool>,
  pub trellis_keep_tasks_for_hours: Option<u64>,
  pub trellis_cleanup_batch_size: Option<usize>,
  pub trellis_agent_stale_after: Option<u64>,
  pub trellis_logging_level: Option<LogLevel>,
  pub trellis_logging_stdio: Option<StdioLogMode>,
  pub trellis_logging_pretty: Option<bool>,
  pub trellis_logging_otlp_endpoint: Option<String>,
  pub trellis_logging_opentelemetry_service_name: Option<String>,
  pub trellis_pretty_startup_config: Option<bool>,
}
