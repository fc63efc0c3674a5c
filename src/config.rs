use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::{ListCache, ListRow, DEFAULT_CAPACITY};
use crate::query_state::{Period, QueryDefaults, SortField};

const DEFAULT_STALE_AFTER_SECS: u64 = 300;
const DEFAULT_LIMIT: u32 = 25;
/// Largest page the issues endpoint serves
const MAX_LIMIT: u32 = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub sentry: SentryConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SentryConfig {
  /// Base URL, e.g. https://sentry.io
  pub url: String,
  /// Organization slug
  pub organization: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Maximum number of cached pages
  #[serde(default = "default_capacity")]
  pub capacity: usize,
  /// Age in seconds after which a page is refetched; 0 disables
  #[serde(default = "default_stale_after_secs")]
  pub stale_after_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      capacity: DEFAULT_CAPACITY,
      stale_after_secs: DEFAULT_STALE_AFTER_SECS,
    }
  }
}

fn default_capacity() -> usize {
  DEFAULT_CAPACITY
}

fn default_stale_after_secs() -> u64 {
  DEFAULT_STALE_AFTER_SECS
}

impl CacheConfig {
  pub fn stale_after(&self) -> Result<Option<Duration>> {
    if self.stale_after_secs == 0 {
      return Ok(None);
    }
    i64::try_from(self.stale_after_secs)
      .ok()
      .and_then(Duration::try_seconds)
      .map(Some)
      .ok_or_else(|| eyre!("Invalid stale_after_secs: {} is too large", self.stale_after_secs))
  }

  pub fn build<R: ListRow>(&self) -> Result<ListCache<R>> {
    Ok(ListCache::new(self.capacity).with_stale_after(self.stale_after()?))
  }
}

/// Values used when the URL leaves a field out
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsConfig {
  pub query: Option<String>,
  pub sort: Option<String>,
  pub period: Option<String>,
  /// Issues per page
  pub limit: Option<u32>,
}

impl DefaultsConfig {
  pub fn limit(&self) -> u32 {
    self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
  }

  /// Unlike URL input, bad values here are reported rather than ignored.
  pub fn query_defaults(&self) -> Result<QueryDefaults> {
    let mut defaults = QueryDefaults::default();

    if let Some(query) = &self.query {
      defaults.query = query.trim().to_string();
    }
    if let Some(sort) = &self.sort {
      defaults.sort = SortField::parse(sort).ok_or_else(|| eyre!("Invalid default sort: {}", sort))?;
    }
    if let Some(period) = &self.period {
      defaults.period =
        Period::parse(period).ok_or_else(|| eyre!("Invalid default period: {}", period))?;
    }

    Ok(defaults)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./issuelist.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/issuelist/config.yaml
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
        "No configuration file found. Create one at ~/.config/issuelist/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("issuelist.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("issuelist").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.defaults.query_defaults()?;
    config.cache.stale_after()?;
    Ok(config)
  }

  /// Get the Sentry auth token from environment variables.
  ///
  /// Checks ISSUELIST_AUTH_TOKEN first, then SENTRY_AUTH_TOKEN as fallback.
  pub fn get_auth_token() -> Result<String> {
    std::env::var("ISSUELIST_AUTH_TOKEN")
      .or_else(|_| std::env::var("SENTRY_AUTH_TOKEN"))
      .map_err(|_| {
        eyre!(
          "Sentry auth token not found. Set ISSUELIST_AUTH_TOKEN or SENTRY_AUTH_TOKEN environment variable."
        )
      })
  }
}
