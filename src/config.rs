use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cache::{CollectionName, StalenessPolicy, TimestampComparison};
use crate::remote::Filters;

/// Collections scoped to the configured company.
const COMPANY_SCOPED: [CollectionName; 4] = [
  CollectionName::Vans,
  CollectionName::Trips,
  CollectionName::Users,
  CollectionName::Branches,
];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
  #[serde(default)]
  pub access: AccessConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Project URL, e.g. https://xyz.supabase.co
  pub url: String,
  /// Only load records of this company
  pub company_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Keep a SQLite snapshot so the next run starts warm
  #[serde(default = "default_persist")]
  pub persist: bool,
  /// Database path (defaults to $XDG_DATA_HOME/fleetcache/cache.db)
  pub path: Option<PathBuf>,
  /// Per-collection TTL overrides
  #[serde(default)]
  pub ttl_seconds: BTreeMap<CollectionName, u64>,
  #[serde(default)]
  pub timestamp_comparison: TimestampComparison,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      persist: default_persist(),
      path: None,
      ttl_seconds: BTreeMap::new(),
      timestamp_comparison: TimestampComparison::default(),
    }
  }
}

fn default_persist() -> bool {
  true
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Filter directive, overridden by RUST_LOG
  #[serde(default = "default_level")]
  pub level: String,
  /// Write daily log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_level(),
      directory: None,
    }
  }
}

fn default_level() -> String {
  "info".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessConfig {
  /// User group whose permission document gates mutations.
  /// Without one every mutation is allowed.
  pub group_id: Option<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fleetcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fleetcache/config.yaml
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
        "No configuration file found. Create one at ~/.config/fleetcache/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("fleetcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fleetcache").join("config.yaml");
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
    config.staleness_policy()?;
    Ok(config)
  }

  /// Get the API key from environment variables.
  ///
  /// Checks FLEETCACHE_API_KEY first, then SUPABASE_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("FLEETCACHE_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_KEY"))
      .map_err(|_| {
        eyre!("API key not found. Set FLEETCACHE_API_KEY or SUPABASE_KEY environment variable.")
      })
  }

  /// Default TTLs with the configured overrides applied.
  pub fn staleness_policy(&self) -> Result<StalenessPolicy> {
    let mut policy = StalenessPolicy::default();
    for (&name, &secs) in &self.cache.ttl_seconds {
      let ttl = i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| eyre!("TTL for {} is out of range: {} seconds", name, secs))?;
      policy = policy.with_ttl(name, ttl);
    }
    Ok(policy)
  }

  /// Fetch filters implied by the company scope.
  pub fn scope_filters(&self) -> Vec<(CollectionName, Filters)> {
    let Some(company_id) = &self.remote.company_id else {
      return Vec::new();
    };
    COMPANY_SCOPED
      .iter()
      .map(|&name| (name, Filters::new().eq("company_id", company_id.clone())))
      .collect()
  }
}
