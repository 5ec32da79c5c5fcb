//! Core traits and types for the caching system.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};

/// Durable string key-value storage shared by all caches.
///
/// Keys are namespaced by the caller (e.g. `stillnest_cache_photos`). Callers in
/// the cache layer treat every error as non-fatal.
pub trait KeyValueStore: Send + Sync {
  /// Read the value stored under `key`.
  fn get_item(&self, key: &str) -> Result<Option<String>>;

  /// Store `value` under `key`, replacing any previous value.
  fn set_item(&self, key: &str, value: &str) -> Result<()>;

  /// Remove `key`. Removing a missing key is not an error.
  fn remove_item(&self, key: &str) -> Result<()>;
}

/// A cached value with its storage and expiry timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub data: T,
  pub stored_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T, stored_at: DateTime<Utc>, ttl: Duration) -> Self {
    Self {
      data,
      stored_at,
      expires_at: stored_at + ttl,
    }
  }

  /// An entry is valid up to and including its expiry instant.
  pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
    now <= self.expires_at
  }
}

/// Point-in-time counts for one cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub total: usize,
  pub valid: usize,
  pub expired: usize,
  pub max_size: usize,
}

/// Size and lifetime policy of a cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
  /// How long an entry stays valid unless overridden on `set`
  pub ttl: Duration,
  /// Maximum number of entries kept in memory
  pub max_size: usize,
  /// Whether the map is mirrored to durable storage
  pub persist: bool,
}

impl Default for CachePolicy {
  fn default() -> Self {
    Self {
      ttl: Duration::minutes(5),
      max_size: 100,
      persist: false,
    }
  }
}

/// Anything the background sweeper can clean up.
pub trait Sweep: Send + Sync {
  /// Name used in logs.
  fn name(&self) -> &str;

  /// Drop expired entries, returning how many were removed.
  fn sweep_expired(&self) -> usize;
}
