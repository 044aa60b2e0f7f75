use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL that relative request URLs are resolved against
  pub origin: String,
  /// SQLite database path (defaults to the user data directory)
  pub database: Option<PathBuf>,
  /// How often cache metrics are reported to connected pages
  pub metrics_interval_secs: u64,
  pub cache: CacheConfig,
  pub notifications: NotificationConfig,
  pub sync: SyncConfig,
  pub logging: LoggingConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:4200".to_string(),
      database: None,
      metrics_interval_secs: 60,
      cache: CacheConfig::default(),
      notifications: NotificationConfig::default(),
      sync: SyncConfig::default(),
      logging: LoggingConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Application cache-name prefix; partitions are `<prefix>-<kind>-<version>`
  pub prefix: String,
  pub version: String,
  /// Assets pre-cached on install and always served cache-first
  pub static_assets: Vec<String>,
  /// Regexes selecting cacheable API requests (empty disables API caching)
  pub api_patterns: Vec<String>,
  /// Image hosting URL prefixes
  pub image_hosts: Vec<String>,
  pub api_max_age_secs: u64,
  /// Optional image served when an image cannot be fetched
  pub image_placeholder: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "book-search".to_string(),
      version: "v1".to_string(),
      static_assets: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/manifest.json".to_string(),
        "/favicon.ico".to_string(),
      ],
      api_patterns: vec!["/api/books".to_string(), "/api/search".to_string()],
      image_hosts: vec![
        "https://covers.openlibrary.org".to_string(),
        "https://books.google.com".to_string(),
      ],
      api_max_age_secs: 15 * 60,
      image_placeholder: None,
    }
  }
}

impl CacheConfig {
  pub fn api_max_age(&self) -> Duration {
    Duration::from_secs(self.api_max_age_secs)
  }

  /// Compile the API patterns, failing on the first invalid one.
  pub fn compiled_api_patterns(&self) -> Result<Vec<Regex>> {
    self
      .api_patterns
      .iter()
      .map(|p| Regex::new(p).map_err(|e| eyre!("Invalid API cache pattern '{}': {}", p, e)))
      .collect()
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  /// Generic tag shared by notifications so new ones replace old ones
  pub tag: String,
  pub icon: String,
  pub badge: String,
  /// Endpoint of an existing push subscription, if the app has one
  pub push_endpoint: Option<String>,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      tag: "book-search-notification".to_string(),
      icon: "/assets/icons/icon-192x192.png".to_string(),
      badge: "/assets/icons/badge-72x72.png".to_string(),
      push_endpoint: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub books_endpoint: String,
  pub favorites_endpoint: String,
  pub preferences_endpoint: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      books_endpoint: "/api/sync/books".to_string(),
      favorites_endpoint: "/api/sync/favorites".to_string(),
      preferences_endpoint: "/api/sync/preferences".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  pub level: String,
  /// Rolling log file; logs go to stderr only when unset
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shelfcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shelfcache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shelfcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shelfcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    self.cache.compiled_api_patterns()?;
    if self.cache.prefix.is_empty() {
      return Err(eyre!("cache.prefix must not be empty"));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  pub fn metrics_interval(&self) -> Duration {
    Duration::from_secs(self.metrics_interval_secs.max(1))
  }
}
