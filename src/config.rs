use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::recommend::DedupPolicy;

/// Sync tag fired when connectivity is restored.
pub const DEFAULT_SYNC_TAG: &str = "sync-quiz-results";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub recommendations: RecommendationConfig,
  /// Directory holding the offline database (defaults to $XDG_DATA_HOME/edusync)
  pub data_dir: Option<PathBuf>,
  /// Write logs to daily files in this directory instead of stderr
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  #[serde(default = "default_base_url")]
  pub base_url: String,
  /// Per-request timeout
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: default_base_url(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Name of the live cache namespace
  #[serde(default = "default_cache_version")]
  pub version: String,
  /// Namespaces written by earlier releases
  #[serde(default)]
  pub previous_versions: Vec<String>,
  /// Static assets stored on install
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  /// Document served for offline navigations with no cache entry
  #[serde(default = "default_fallback_document")]
  pub fallback_document: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: default_cache_version(),
      previous_versions: Vec::new(),
      precache: default_precache(),
      fallback_document: default_fallback_document(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_sync_tag")]
  pub tag: String,
  /// Failed deliveries before a result is parked as permanently failed
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  /// How often `watch` probes connectivity
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: default_sync_tag(),
      max_attempts: default_max_attempts(),
      probe_interval_secs: default_probe_interval_secs(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecommendationConfig {
  #[serde(default)]
  pub dedup: DedupPolicy,
  pub limit: Option<usize>,
}

fn default_base_url() -> String {
  "http://localhost:3000/".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_cache_version() -> String {
  "edusync-v1".to_string()
}

fn default_precache() -> Vec<String> {
  vec![
    "/".to_string(),
    "/index.html".to_string(),
    "/manifest.json".to_string(),
  ]
}

fn default_fallback_document() -> String {
  "/index.html".to_string()
}

fn default_sync_tag() -> String {
  DEFAULT_SYNC_TAG.to_string()
}

fn default_max_attempts() -> u32 {
  5
}

fn default_probe_interval_secs() -> u64 {
  15
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./edusync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/edusync/config.yaml
  ///
  /// Falls back to defaults when no file exists.
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
    let local = PathBuf::from("edusync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("edusync").join("config.yaml");
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

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.cache.version.trim().is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }
    if config.sync.max_attempts == 0 {
      return Err(eyre!("sync.max_attempts must be at least 1"));
    }
    Ok(config)
  }

  /// Path of the offline SQLite database.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.data_dir {
      Some(dir) => Ok(dir.join(crate::db::DATABASE_FILE)),
      None => crate::db::default_path(),
    }
  }

  /// Get the API bearer token from the environment, if any.
  ///
  /// Checks EDUSYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("EDUSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
