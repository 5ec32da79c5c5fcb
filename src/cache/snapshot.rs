//! Durable last-known-good snapshots used by the data loader.
//!
//! Unlike [`TtlCache`](super::TtlCache) entries, snapshots never expire on their
//! own. The loader compares their age against its ttl, so an old snapshot can
//! still be served when the network is unavailable.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use super::traits::KeyValueStore;
use crate::error::DataError;

const SNAPSHOT_PREFIX: &str = "stillnest_offline_";

/// Last fetched value for a query key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<T> {
  pub data: T,
  pub fetched_at: DateTime<Utc>,
}

impl<T> Snapshot<T> {
  pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
    now - self.fetched_at > ttl
  }
}

/// Reads and writes snapshots through a key-value store, swallowing failures.
#[derive(Clone)]
pub struct SnapshotStore {
  store: Arc<dyn KeyValueStore>,
}

impl SnapshotStore {
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self { store }
  }

  fn storage_key(key: &str) -> String {
    format!("{}{}", SNAPSHOT_PREFIX, key)
  }

  pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<Snapshot<T>> {
    let raw = match self.store.get_item(&Self::storage_key(key)) {
      Ok(raw) => raw?,
      Err(e) => {
        warn!(key, error = %DataError::storage(&e), "failed to read snapshot");
        return None;
      }
    };

    match serde_json::from_str(&raw) {
      Ok(snapshot) => Some(snapshot),
      Err(e) => {
        warn!(key, error = %DataError::storage(&e), "ignoring unreadable snapshot");
        None
      }
    }
  }

  pub fn save<T: Serialize>(&self, key: &str, data: &T, fetched_at: DateTime<Utc>) {
    let snapshot = Snapshot { data, fetched_at };
    let json = match serde_json::to_string(&snapshot) {
      Ok(json) => json,
      Err(e) => {
        warn!(key, error = %DataError::storage(&e), "failed to serialize snapshot");
        return;
      }
    };

    if let Err(e) = self.store.set_item(&Self::storage_key(key), &json) {
      warn!(key, error = %DataError::storage(&e), "failed to save snapshot");
    }
  }

  pub fn remove(&self, key: &str) {
    if let Err(e) = self.store.remove_item(&Self::storage_key(key)) {
      warn!(key, error = %DataError::storage(&e), "failed to remove snapshot");
    }
  }
}
