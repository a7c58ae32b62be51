use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use swrc::QueryOptions;

const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub network: NetworkConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Base freshness window before network scaling
  pub ttl_ms: u64,
  pub retries: u32,
  /// Unconditional refresh cadence for `watch`; 0 disables it
  pub refresh_interval_ms: u64,
  pub revalidate_on_focus: bool,
  /// Mirror entries to the SQLite store
  pub persist: bool,
  /// Defaults to $XDG_DATA_HOME/swrc/cache.db
  pub db_path: Option<PathBuf>,
  pub quota_bytes: Option<usize>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_ms: 300_000,
      retries: 2,
      refresh_interval_ms: 0,
      revalidate_on_focus: true,
      persist: true,
      db_path: None,
      quota_bytes: None,
    }
  }
}

impl CacheConfig {
  pub fn quota_bytes(&self) -> usize {
    self.quota_bytes.unwrap_or(DEFAULT_QUOTA_BYTES)
  }

  pub fn query_options(&self) -> QueryOptions {
    QueryOptions::default()
      .with_ttl(Duration::from_millis(self.ttl_ms))
      .with_retries(self.retries)
      .with_refresh_interval(Duration::from_millis(self.refresh_interval_ms))
      .with_revalidate_on_focus(self.revalidate_on_focus)
      .with_persist(self.persist)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Endpoint probed with HEAD requests to estimate connection quality
  pub probe_url: Option<String>,
  pub probe_interval_ms: u64,
  pub save_data: bool,
  pub timeout_ms: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_ms: 15_000,
      save_data: false,
      timeout_ms: 10_000,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive, e.g. "swrc=debug"
  pub level: Option<String>,
  /// Write logs here instead of stderr
  pub file: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swrc.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swrc/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("swrc.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swrc").join("config.yaml");
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

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty file parses as null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Bearer token for API requests, from SWRC_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("SWRC_TOKEN").ok().filter(|t| !t.is_empty())
  }
}
