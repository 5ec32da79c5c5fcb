//! In-memory TTL cache with max-size eviction and optional durable mirroring.

use chrono::Duration;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::traits::{CacheEntry, CachePolicy, CacheStats, KeyValueStore, Sweep};
use crate::clock::SharedClock;
use crate::error::DataError;

/// Prefix of the durable record holding a persisted cache.
const STORAGE_PREFIX: &str = "stillnest_cache_";

struct Slot<T> {
  /// Insertion sequence number; lowest is evicted first
  seq: u64,
  entry: CacheEntry<T>,
}

struct CacheMap<T> {
  slots: HashMap<String, Slot<T>>,
  next_seq: u64,
}

impl<T> CacheMap<T> {
  fn new() -> Self {
    Self {
      slots: HashMap::new(),
      next_seq: 0,
    }
  }

  fn push(&mut self, key: String, entry: CacheEntry<T>) {
    let seq = self.next_seq;
    self.next_seq += 1;
    self.slots.insert(key, Slot { seq, entry });
  }

  fn oldest_key(&self) -> Option<String> {
    self
      .slots
      .iter()
      .min_by_key(|(_, slot)| slot.seq)
      .map(|(key, _)| key.clone())
  }

  /// Entries in insertion order.
  fn ordered(&self) -> Vec<(&String, &CacheEntry<T>)> {
    let mut items: Vec<(&String, &Slot<T>)> = self.slots.iter().collect();
    items.sort_by_key(|(_, slot)| slot.seq);
    items
      .into_iter()
      .map(|(key, slot)| (key, &slot.entry))
      .collect()
  }
}

/// Keyed cache whose entries expire after a time-to-live.
///
/// When the policy asks for persistence, the whole map is written to the
/// key-value store after every mutation and read back on construction.
/// Storage failures are logged and never surface to callers.
pub struct TtlCache<T> {
  name: String,
  storage_key: String,
  policy: CachePolicy,
  map: Mutex<CacheMap<T>>,
  store: Arc<dyn KeyValueStore>,
  clock: SharedClock,
}

impl<T> TtlCache<T>
where
  T: Clone + Serialize + DeserializeOwned + Send,
{
  pub fn new(
    name: &str,
    policy: CachePolicy,
    store: Arc<dyn KeyValueStore>,
    clock: SharedClock,
  ) -> Self {
    let cache = Self {
      name: name.to_string(),
      storage_key: format!("{}{}", STORAGE_PREFIX, name),
      policy,
      map: Mutex::new(CacheMap::new()),
      store,
      clock,
    };

    if cache.policy.persist {
      cache.load_from_storage();
    }

    cache
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn policy(&self) -> CachePolicy {
    self.policy
  }

  /// Store `data` under `key`, expiring after `ttl` or the cache default.
  ///
  /// Inserting a new key into a full cache evicts the oldest-inserted entry
  /// first. Overwriting an existing key keeps its position and evicts nothing.
  pub fn set(&self, key: &str, data: T, ttl: Option<Duration>) {
    if self.policy.max_size == 0 {
      return;
    }

    let now = self.clock.now();
    let entry = CacheEntry::new(data, now, ttl.unwrap_or(self.policy.ttl));

    let mut map = self.lock();
    if map.slots.contains_key(key) {
      if let Some(slot) = map.slots.get_mut(key) {
        slot.entry = entry;
      }
    } else {
      if map.slots.len() >= self.policy.max_size {
        if let Some(oldest) = map.oldest_key() {
          map.slots.remove(&oldest);
          debug!(cache = %self.name, key = %oldest, "evicted oldest entry");
        }
      }
      map.push(key.to_string(), entry);
    }

    if self.policy.persist {
      self.save_to_storage(&map);
    }
  }

  /// Get a valid entry. An expired entry is removed as a side effect.
  pub fn get(&self, key: &str) -> Option<T> {
    let now = self.clock.now();
    let mut map = self.lock();

    let valid = map.slots.get(key)?.entry.is_valid_at(now);
    if valid {
      return map.slots.get(key).map(|slot| slot.entry.data.clone());
    }

    map.slots.remove(key);
    if self.policy.persist {
      self.save_to_storage(&map);
    }
    None
  }

  pub fn has(&self, key: &str) -> bool {
    self.get(key).is_some()
  }

  /// Remove one entry, returning whether it existed.
  pub fn delete(&self, key: &str) -> bool {
    let mut map = self.lock();
    let deleted = map.slots.remove(key).is_some();
    if deleted && self.policy.persist {
      self.save_to_storage(&map);
    }
    deleted
  }

  /// Remove every entry, including the durable copy.
  pub fn clear(&self) {
    let mut map = self.lock();
    map.slots.clear();
    if self.policy.persist {
      if let Err(e) = self.store.remove_item(&self.storage_key) {
        warn!(cache = %self.name, error = %DataError::storage(&e), "failed to remove persisted cache");
      }
    }
  }

  pub fn len(&self) -> usize {
    self.lock().slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Keys in insertion order, expired ones included.
  pub fn keys(&self) -> Vec<String> {
    self
      .lock()
      .ordered()
      .into_iter()
      .map(|(key, _)| key.clone())
      .collect()
  }

  /// Count valid and expired entries without touching them.
  pub fn stats(&self) -> CacheStats {
    let now = self.clock.now();
    let map = self.lock();
    let valid = map
      .slots
      .values()
      .filter(|slot| slot.entry.is_valid_at(now))
      .count();

    CacheStats {
      total: map.slots.len(),
      valid,
      expired: map.slots.len() - valid,
      max_size: self.policy.max_size,
    }
  }

  fn lock(&self) -> MutexGuard<'_, CacheMap<T>> {
    // A panic while holding the lock cannot leave the map half-updated
    self.map.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn save_to_storage(&self, map: &CacheMap<T>) {
    let json = match serde_json::to_string(&map.ordered()) {
      Ok(json) => json,
      Err(e) => {
        warn!(cache = %self.name, error = %DataError::storage(&e), "failed to serialize cache");
        return;
      }
    };

    if let Err(e) = self.store.set_item(&self.storage_key, &json) {
      warn!(cache = %self.name, error = %DataError::storage(&e), "failed to persist cache");
    }
  }

  fn load_from_storage(&self) {
    let raw = match self.store.get_item(&self.storage_key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return,
      Err(e) => {
        warn!(cache = %self.name, error = %DataError::storage(&e), "failed to load persisted cache");
        return;
      }
    };

    let entries: Vec<(String, CacheEntry<T>)> = match serde_json::from_str(&raw) {
      Ok(entries) => entries,
      Err(e) => {
        warn!(cache = %self.name, error = %DataError::storage(&e), "discarding unreadable persisted cache");
        return;
      }
    };

    let now = self.clock.now();
    let mut map = self.lock();
    let mut dropped = 0;
    for (key, entry) in entries {
      if entry.is_valid_at(now) {
        map.push(key, entry);
      } else {
        dropped += 1;
      }
    }

    // The configured size may have shrunk since the map was written
    let mut trimmed = 0;
    while map.slots.len() > self.policy.max_size {
      let Some(oldest) = map.oldest_key() else {
        break;
      };
      map.slots.remove(&oldest);
      trimmed += 1;
    }
    if trimmed > 0 {
      self.save_to_storage(&map);
    }

    debug!(
      cache = %self.name,
      loaded = map.slots.len(),
      dropped,
      trimmed,
      "restored persisted cache"
    );
  }
}

impl<T> Sweep for TtlCache<T>
where
  T: Clone + Serialize + DeserializeOwned + Send,
{
  fn name(&self) -> &str {
    &self.name
  }

  fn sweep_expired(&self) -> usize {
    let now = self.clock.now();
    let mut map = self.lock();
    let before = map.slots.len();
    map.slots.retain(|_, slot| slot.entry.expires_at >= now);
    let removed = before - map.slots.len();

    if removed > 0 && self.policy.persist {
      self.save_to_storage(&map);
    }
    removed
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStore;
  use crate::clock::ManualClock;
  use color_eyre::{eyre::eyre, Result};

  struct FailingStore;

  impl KeyValueStore for FailingStore {
    fn get_item(&self, _key: &str) -> Result<Option<String>> {
      Err(eyre!("storage unavailable"))
    }

    fn set_item(&self, _key: &str, _value: &str) -> Result<()> {
      Err(eyre!("quota exceeded"))
    }

    fn remove_item(&self, _key: &str) -> Result<()> {
      Err(eyre!("storage unavailable"))
    }
  }

  fn policy(ttl_ms: i64, max_size: usize, persist: bool) -> CachePolicy {
    CachePolicy {
      ttl: Duration::milliseconds(ttl_ms),
      max_size,
      persist,
    }
  }

  fn cache_with(
    policy: CachePolicy,
    store: Arc<dyn KeyValueStore>,
  ) -> (TtlCache<String>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_epoch());
    let cache = TtlCache::new("photos", policy, store, clock.clone());
    (cache, clock)
  }

  #[test]
  fn test_entry_expires_after_ttl() {
    let (cache, clock) = cache_with(policy(1000, 10, false), Arc::new(MemoryStore::new()));

    cache.set("k", "A".to_string(), None);
    clock.advance(Duration::milliseconds(500));
    assert_eq!(cache.get("k").as_deref(), Some("A"));

    clock.advance(Duration::milliseconds(1000));
    assert_eq!(cache.get("k"), None);
    assert_eq!(cache.len(), 0);
  }

  #[test]
  fn test_entry_valid_at_exact_expiry() {
    let (cache, clock) = cache_with(policy(1000, 10, false), Arc::new(MemoryStore::new()));

    cache.set("k", "A".to_string(), None);
    clock.advance(Duration::milliseconds(1000));
    assert!(cache.has("k"));
    clock.advance(Duration::milliseconds(1));
    assert!(!cache.has("k"));
  }

  #[test]
  fn test_lazy_eviction_is_permanent() {
    let (cache, clock) = cache_with(policy(100, 10, false), Arc::new(MemoryStore::new()));

    cache.set("k", "A".to_string(), None);
    clock.advance(Duration::milliseconds(200));
    assert_eq!(cache.get("k"), None);

    // Turning the clock back does not resurrect the entry
    clock.set(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
    assert!(!cache.has("k"));
  }

  #[test]
  fn test_full_cache_evicts_oldest_inserted() {
    let (cache, _clock) = cache_with(policy(60_000, 2, false), Arc::new(MemoryStore::new()));

    cache.set("a", "1".to_string(), None);
    cache.set("b", "2".to_string(), None);
    cache.set("c", "3".to_string(), None);

    assert_eq!(cache.keys(), vec!["b".to_string(), "c".to_string()]);
  }

  #[test]
  fn test_eviction_ignores_ttl_order() {
    let (cache, _clock) = cache_with(policy(60_000, 2, false), Arc::new(MemoryStore::new()));

    // "a" expires much later than "b" but was inserted first
    cache.set("a", "1".to_string(), Some(Duration::hours(1)));
    cache.set("b", "2".to_string(), Some(Duration::seconds(1)));
    cache.set("c", "3".to_string(), None);

    assert!(!cache.has("a"));
    assert!(cache.has("b"));
    assert!(cache.has("c"));
  }

  #[test]
  fn test_overwrite_keeps_position_without_eviction() {
    let (cache, _clock) = cache_with(policy(60_000, 2, false), Arc::new(MemoryStore::new()));

    cache.set("a", "1".to_string(), None);
    cache.set("b", "2".to_string(), None);
    cache.set("a", "updated".to_string(), None);

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get("a").as_deref(), Some("updated"));

    // "a" is still the oldest insertion
    cache.set("c", "3".to_string(), None);
    assert_eq!(cache.keys(), vec!["b".to_string(), "c".to_string()]);
  }

  #[test]
  fn test_ttl_override() {
    let (cache, clock) = cache_with(policy(1000, 10, false), Arc::new(MemoryStore::new()));

    cache.set("short", "s".to_string(), Some(Duration::milliseconds(10)));
    cache.set("long", "l".to_string(), None);
    clock.advance(Duration::milliseconds(20));

    assert!(!cache.has("short"));
    assert!(cache.has("long"));
  }

  #[test]
  fn test_stats_do_not_mutate() {
    let (cache, clock) = cache_with(policy(1000, 5, false), Arc::new(MemoryStore::new()));

    cache.set("old", "1".to_string(), None);
    clock.advance(Duration::milliseconds(800));
    cache.set("new", "2".to_string(), None);
    clock.advance(Duration::milliseconds(400));

    let stats = cache.stats();
    assert_eq!(
      stats,
      CacheStats {
        total: 2,
        valid: 1,
        expired: 1,
        max_size: 5,
      }
    );
    assert_eq!(cache.len(), 2);
  }

  #[test]
  fn test_sweep_removes_expired_and_persists() {
    let store = Arc::new(MemoryStore::new());
    let (cache, clock) = cache_with(policy(1000, 5, true), store.clone());

    cache.set("old", "1".to_string(), None);
    clock.advance(Duration::milliseconds(800));
    cache.set("new", "2".to_string(), None);
    clock.advance(Duration::milliseconds(400));

    assert_eq!(cache.sweep_expired(), 1);
    assert_eq!(cache.keys(), vec!["new".to_string()]);

    let raw = store.get_item("stillnest_cache_photos").unwrap().unwrap();
    assert!(!raw.contains("\"old\""));
    assert!(raw.contains("\"new\""));
  }

  #[test]
  fn test_persisted_cache_reloads_valid_entries() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::at_epoch());

    let cache = TtlCache::new("users", policy(1000, 10, true), store.clone(), clock.clone());
    cache.set("short", "s".to_string(), Some(Duration::milliseconds(100)));
    cache.set("k", "v".to_string(), None);
    clock.advance(Duration::milliseconds(500));

    let restored: TtlCache<String> =
      TtlCache::new("users", policy(1000, 10, true), store, clock.clone());
    assert_eq!(restored.get("k").as_deref(), Some("v"));
    assert_eq!(restored.keys(), vec!["k".to_string()]);
  }

  #[test]
  fn test_reload_trims_to_smaller_max_size() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::at_epoch());

    let cache = TtlCache::new("photos", policy(60_000, 5, true), store.clone(), clock.clone());
    for key in ["a", "b", "c", "d"] {
      cache.set(key, key.to_uppercase(), None);
    }

    let restored: TtlCache<String> =
      TtlCache::new("photos", policy(60_000, 2, true), store.clone(), clock.clone());
    assert_eq!(restored.keys(), vec!["c".to_string(), "d".to_string()]);

    // New inserts keep the cache at its limit
    restored.set("e", "E".to_string(), None);
    assert_eq!(restored.keys(), vec!["d".to_string(), "e".to_string()]);

    let raw = store.get_item("stillnest_cache_photos").unwrap().unwrap();
    assert!(!raw.contains("\"a\""));
  }

  #[test]
  fn test_non_persisted_cache_writes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let (cache, _clock) = cache_with(policy(1000, 10, false), store.clone());

    cache.set("k", "v".to_string(), None);
    assert_eq!(store.get_item("stillnest_cache_photos").unwrap(), None);
  }

  #[test]
  fn test_clear_removes_durable_record() {
    let store = Arc::new(MemoryStore::new());
    let (cache, _clock) = cache_with(policy(1000, 10, true), store.clone());

    cache.set("k", "v".to_string(), None);
    assert!(store.get_item("stillnest_cache_photos").unwrap().is_some());

    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(store.get_item("stillnest_cache_photos").unwrap(), None);
  }

  #[test]
  fn test_storage_failures_are_swallowed() {
    let (cache, _clock) = cache_with(policy(1000, 10, true), Arc::new(FailingStore));

    cache.set("k", "v".to_string(), None);
    assert_eq!(cache.get("k").as_deref(), Some("v"));
    assert!(cache.delete("k"));
    cache.clear();
  }

  #[test]
  fn test_delete_reports_presence() {
    let (cache, _clock) = cache_with(policy(1000, 10, false), Arc::new(MemoryStore::new()));

    cache.set("k", "v".to_string(), None);
    assert!(cache.delete("k"));
    assert!(!cache.delete("k"));
  }
}
