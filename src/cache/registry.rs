//! The application's cache instances and their key scheme.

use chrono::Duration;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use super::traits::{CachePolicy, CacheStats, KeyValueStore, Sweep};
use super::ttl::TtlCache;
use crate::backend::types::{Photo, SearchFilters, SortOrder, UserProfile};
use crate::clock::SharedClock;

// ============================================================================
// Cache keys
// ============================================================================

/// Keys for cached lookups.
#[derive(Clone, Debug)]
pub enum CacheKey {
  /// A single photo
  Photo { id: String },
  /// A single user profile
  User { id: String },
  /// One page of a user's following feed
  Feed { user_id: String, page: u32 },
  /// One page of a profile gallery
  UserPhotos { user_id: String, page: u32 },
  /// One page of text search results
  Search { filters: SearchFilters, page: u32 },
}

impl CacheKey {
  /// Join key parts with `:`.
  pub fn join(parts: &[&dyn fmt::Display]) -> String {
    parts
      .iter()
      .map(|p| p.to_string())
      .collect::<Vec<_>>()
      .join(":")
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let key = match self {
      Self::Photo { id } => Self::join(&[&"photo", id]),
      Self::User { id } => Self::join(&[&"user", id]),
      Self::Feed { user_id, page } => Self::join(&[&"feed", user_id, page]),
      Self::UserPhotos { user_id, page } => Self::join(&[&"user_photos", user_id, page]),
      Self::Search { filters, page } => {
        // SHA256 hash keeps free text out of storage keys
        let mut hasher = Sha256::new();
        hasher.update(normalize_filters(filters).as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self::join(&[&"search", &digest, page])
      }
    };
    f.write_str(&key)
  }
}

/// Normalize search filters for consistent hashing.
/// Text is trimmed and lowercased, tags are sorted.
fn normalize_filters(filters: &SearchFilters) -> String {
  let mut tags: Vec<String> = filters
    .tags
    .iter()
    .map(|t| t.trim().to_lowercase())
    .collect();
  tags.sort();
  tags.dedup();

  let sort = match filters.sort_by {
    SortOrder::Recent => "recent",
    SortOrder::Oldest => "oldest",
    SortOrder::Popular => "popular",
  };

  format!(
    "q={}|tags={}|from={}|to={}|user={}|sort={}",
    filters
      .query
      .as_deref()
      .map(|q| q.trim().to_lowercase())
      .unwrap_or_default(),
    tags.join(","),
    filters.date_from.as_deref().unwrap_or(""),
    filters.date_to.as_deref().unwrap_or(""),
    filters.user_id.as_deref().unwrap_or(""),
    sort
  )
}

// ============================================================================
// Registry
// ============================================================================

/// Policies for the three application caches.
#[derive(Debug, Clone, Copy)]
pub struct RegistryPolicies {
  pub photos: CachePolicy,
  pub users: CachePolicy,
  pub feed: CachePolicy,
}

impl Default for RegistryPolicies {
  fn default() -> Self {
    Self {
      photos: CachePolicy {
        ttl: Duration::minutes(15),
        max_size: 200,
        persist: true,
      },
      users: CachePolicy {
        ttl: Duration::minutes(10),
        max_size: 50,
        persist: true,
      },
      // Feed pages are volatile and user-specific, so they stay in memory
      feed: CachePolicy {
        ttl: Duration::minutes(5),
        max_size: 20,
        persist: false,
      },
    }
  }
}

/// Stats for every registered cache.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegistryStats {
  pub photos: CacheStats,
  pub users: CacheStats,
  pub feed: CacheStats,
}

/// Owns the application's caches. Built once at startup and passed to
/// whatever needs them.
#[derive(Clone)]
pub struct CacheRegistry {
  pub photos: Arc<TtlCache<Photo>>,
  pub users: Arc<TtlCache<UserProfile>>,
  pub feed: Arc<TtlCache<Vec<Photo>>>,
}

impl CacheRegistry {
  pub fn new(policies: RegistryPolicies, store: Arc<dyn KeyValueStore>, clock: SharedClock) -> Self {
    Self {
      photos: Arc::new(TtlCache::new(
        "photos",
        policies.photos,
        store.clone(),
        clock.clone(),
      )),
      users: Arc::new(TtlCache::new(
        "users",
        policies.users,
        store.clone(),
        clock.clone(),
      )),
      feed: Arc::new(TtlCache::new("feed", policies.feed, store, clock)),
    }
  }

  pub fn clear_all(&self) {
    self.photos.clear();
    self.users.clear();
    self.feed.clear();
  }

  pub fn stats(&self) -> RegistryStats {
    RegistryStats {
      photos: self.photos.stats(),
      users: self.users.stats(),
      feed: self.feed.stats(),
    }
  }

  /// Caches for the background sweeper.
  pub fn sweepers(&self) -> Vec<Arc<dyn Sweep>> {
    vec![
      self.photos.clone() as Arc<dyn Sweep>,
      self.users.clone() as Arc<dyn Sweep>,
      self.feed.clone() as Arc<dyn Sweep>,
    ]
  }
}
