//! Caching layer for data persistence and offline support.
//!
//! This module provides:
//! - TTL caches with insertion-order eviction and optional durable mirroring
//! - Key-value storage backends (SQLite, memory, no-op)
//! - Durable snapshots used by the data loader for offline fallback
//! - A registry owning the application's photo, user and feed caches
//! - A background sweeper removing expired entries

pub mod registry;
pub mod snapshot;
pub mod storage;
pub mod sweeper;
pub mod traits;
pub mod ttl;

pub use registry::{CacheKey, CacheRegistry, RegistryPolicies, RegistryStats};
pub use snapshot::{Snapshot, SnapshotStore};
pub use storage::{MemoryStore, NoopStore, SqliteStore};
pub use sweeper::CacheSweeper;
pub use traits::{CacheEntry, CachePolicy, CacheStats, KeyValueStore, Sweep};
pub use ttl::TtlCache;
