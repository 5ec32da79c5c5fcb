use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{CachePolicy, RegistryPolicies};
use crate::retry::RetryOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  /// Health endpoint probed for connectivity (defaults to `<backend>/api/health`)
  pub probe_url: Option<String>,
  #[serde(default)]
  pub caches: CachesConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub retry: RetryOptions,
  #[serde(default)]
  pub loader: LoaderConfig,
  #[serde(default = "default_sweep_interval_secs")]
  pub sweep_interval_secs: u64,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  pub url: String,
  #[serde(default = "default_page_size")]
  pub page_size: usize,
}

fn default_page_size() -> usize {
  20
}

fn default_sweep_interval_secs() -> u64 {
  60
}

/// One cache's policy as written in the config file
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct CachePolicyConfig {
  pub ttl_secs: i64,
  pub max_size: usize,
  #[serde(default)]
  pub persist: bool,
}

impl From<CachePolicyConfig> for CachePolicy {
  fn from(c: CachePolicyConfig) -> Self {
    CachePolicy {
      ttl: chrono::Duration::seconds(c.ttl_secs),
      max_size: c.max_size,
      persist: c.persist,
    }
  }
}

impl From<CachePolicy> for CachePolicyConfig {
  fn from(p: CachePolicy) -> Self {
    CachePolicyConfig {
      ttl_secs: p.ttl.num_seconds(),
      max_size: p.max_size,
      persist: p.persist,
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct CachesConfig {
  pub photos: CachePolicyConfig,
  pub users: CachePolicyConfig,
  pub feed: CachePolicyConfig,
}

impl Default for CachesConfig {
  fn default() -> Self {
    let defaults = RegistryPolicies::default();
    Self {
      photos: defaults.photos.into(),
      users: defaults.users.into(),
      feed: defaults.feed.into(),
    }
  }
}

impl CachesConfig {
  pub fn policies(&self) -> RegistryPolicies {
    RegistryPolicies {
      photos: self.photos.into(),
      users: self.users.into(),
      feed: self.feed.into(),
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_timeout_ms: u64,
  pub check_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_timeout_ms: 5000,
      check_interval_secs: 30,
    }
  }
}

impl ConnectivityConfig {
  pub fn probe_timeout(&self) -> Duration {
    Duration::from_millis(self.probe_timeout_ms)
  }

  pub fn check_interval(&self) -> Duration {
    Duration::from_secs(self.check_interval_secs)
  }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoaderConfig {
  pub ttl_secs: i64,
}

impl Default for LoaderConfig {
  fn default() -> Self {
    Self { ttl_secs: 300 }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive used when RUST_LOG is unset
  pub level: String,
  /// Directory for log files (defaults to the data directory)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stillnest.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stillnest/config.yaml
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
        "No configuration file found. Create one at ~/.config/stillnest/config.yaml\n\
                 See stillnest.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("stillnest.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stillnest").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.backend_url()?;
    Ok(config)
  }

  pub fn backend_url(&self) -> Result<Url> {
    Url::parse(&self.backend.url).map_err(|e| eyre!("Invalid backend url {}: {}", self.backend.url, e))
  }

  /// The probe endpoint, `<backend>/api/health` unless configured.
  pub fn probe_url(&self) -> Result<Url> {
    match &self.probe_url {
      Some(url) => Url::parse(url).map_err(|e| eyre!("Invalid probe url {}: {}", url, e)),
      None => self
        .backend_url()?
        .join("/api/health")
        .map_err(|e| eyre!("Invalid probe url: {}", e)),
    }
  }

  pub fn loader_ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.loader.ttl_secs)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs)
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks STILLNEST_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("STILLNEST_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("Backend API key not found. Set STILLNEST_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }
}
