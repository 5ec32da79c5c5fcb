//! Offline-aware data loading for a single query key.
//!
//! A [`DataLoader`] decides what a view should show right now:
//!
//! 1. Offline - serve the last snapshot, else fallback data, else `NoData`
//! 2. Online with a fresh snapshot - serve it without touching the network
//! 3. Otherwise fetch; on failure degrade to the snapshot (even if stale),
//!    then to fallback data, and only then report the error
//!
//! When connectivity comes back and the loader is showing cached data with an
//! error attached, it reloads by itself.
//!
//! # Example
//!
//! ```ignore
//! let client = backend.clone();
//! let loader = DataLoader::new(
//!   LoaderOptions::new("feed:u1:0").with_ttl(Duration::minutes(5)),
//!   move || {
//!     let client = client.clone();
//!     async move { client.get_feed("u1", 0).await }
//!   },
//!   snapshots,
//!   monitor.subscribe(),
//!   clock,
//! );
//!
//! let photos = loader.load(false).await?;
//! if loader.state().is_stale {
//!   show_offline_badge();
//! }
//! ```

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use futures::future::{FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::{Snapshot, SnapshotStore};
use crate::clock::SharedClock;
use crate::connectivity::ConnectivityState;
use crate::error::DataError;

/// Where the served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
  /// Durable snapshot
  Cache,
  /// Fresh fetch
  Network,
  /// Caller-provided fallback data
  Fallback,
}

/// What a view should render for one query.
#[derive(Debug, Clone)]
pub struct LoaderState<T> {
  pub data: Option<T>,
  pub is_loading: bool,
  pub error: Option<DataError>,
  /// Served data is older than the ttl, or replaces a failed fetch
  pub is_stale: bool,
  pub last_fetched: Option<DateTime<Utc>>,
  pub source: DataSource,
}

impl<T> Default for LoaderState<T> {
  fn default() -> Self {
    Self {
      data: None,
      is_loading: false,
      error: None,
      is_stale: false,
      last_fetched: None,
      source: DataSource::Cache,
    }
  }
}

impl<T> LoaderState<T> {
  pub fn is_from_cache(&self) -> bool {
    self.source == DataSource::Cache
  }

  pub fn is_from_network(&self) -> bool {
    self.source == DataSource::Network
  }

  pub fn is_from_fallback(&self) -> bool {
    self.source == DataSource::Fallback
  }
}

/// A boxed future returned by fetchers
type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// A factory function that creates futures for fetching data
type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<T> + Send + Sync>;

type ErrorHook = Box<dyn Fn(&DataError) + Send + Sync>;

type LoadFuture<T> = Pin<Box<dyn Future<Output = std::result::Result<T, DataError>> + Send>>;

struct InFlight<T> {
  id: u64,
  forced: bool,
  future: Shared<LoadFuture<T>>,
}

/// Per-query loader settings.
pub struct LoaderOptions<T> {
  key: String,
  ttl: Duration,
  fallback: Option<T>,
  on_error: Option<ErrorHook>,
}

impl<T> LoaderOptions<T> {
  /// Options for `key` with a 5 minute ttl and no fallback.
  pub fn new(key: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      ttl: Duration::minutes(5),
      fallback: None,
      on_error: None,
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  /// Data to show when neither the network nor a snapshot can provide any.
  pub fn with_fallback(mut self, fallback: T) -> Self {
    self.fallback = Some(fallback);
    self
  }

  /// Called whenever a network fetch fails.
  pub fn on_error<F>(mut self, hook: F) -> Self
  where
    F: Fn(&DataError) + Send + Sync + 'static,
  {
    self.on_error = Some(Box::new(hook));
    self
  }
}

struct LoaderInner<T> {
  key: String,
  ttl: Duration,
  fallback: Option<T>,
  on_error: Option<ErrorHook>,
  fetcher: FetcherFn<T>,
  snapshots: SnapshotStore,
  connectivity: watch::Receiver<ConnectivityState>,
  clock: SharedClock,
  state_tx: watch::Sender<LoaderState<T>>,
  in_flight: Mutex<Option<InFlight<T>>>,
  next_flight: AtomicU64,
  /// Cleared when the owning `DataLoader` is dropped
  mounted: AtomicBool,
}

impl<T> LoaderInner<T>
where
  T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
  /// Start a load, or join the one already running.
  ///
  /// A forced load never joins a plain one, since that may be answered from
  /// the snapshot. It queues behind it instead.
  fn load(self: &Arc<Self>, force_refresh: bool) -> Shared<LoadFuture<T>> {
    let mut slot = self.lock_in_flight();
    let previous = match slot.as_ref() {
      Some(flight) if flight.forced || !force_refresh => {
        debug!(key = %self.key, "joining in-flight load");
        return flight.future.clone();
      }
      Some(flight) => Some(flight.future.clone()),
      None => None,
    };

    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
    let this = Arc::clone(self);
    let future: LoadFuture<T> = Box::pin(async move {
      if let Some(previous) = previous {
        let _ = previous.await;
      }
      let result = this.run_load(force_refresh).await;
      {
        let mut slot = this.lock_in_flight();
        if slot.as_ref().is_some_and(|flight| flight.id == id) {
          slot.take();
        }
      }
      result
    });
    let shared = future.shared();
    *slot = Some(InFlight {
      id,
      forced: force_refresh,
      future: shared.clone(),
    });
    shared
  }

  async fn run_load(&self, force_refresh: bool) -> std::result::Result<T, DataError> {
    self.state_tx.send_if_modified(|state| {
      state.is_loading = true;
      state.error = None;
      self.mounted.load(Ordering::SeqCst)
    });

    let now = self.clock.now();
    let snapshot: Option<Snapshot<T>> = self.snapshots.load(&self.key);
    let is_stale = snapshot
      .as_ref()
      .map(|s| s.is_stale(now, self.ttl))
      .unwrap_or(true);
    let offline = self.connectivity.borrow().is_offline;

    if offline {
      return self.serve_offline(snapshot, is_stale);
    }

    if let Some(snapshot) = snapshot.as_ref() {
      if !is_stale && !force_refresh {
        self.publish(LoaderState {
          data: Some(snapshot.data.clone()),
          is_loading: false,
          error: None,
          is_stale: false,
          last_fetched: Some(snapshot.fetched_at),
          source: DataSource::Cache,
        });
        return Ok(snapshot.data.clone());
      }
    }

    match (self.fetcher)().await {
      Ok(data) => {
        let fetched_at = self.clock.now();
        self.snapshots.save(&self.key, &data, fetched_at);
        self.publish(LoaderState {
          data: Some(data.clone()),
          is_loading: false,
          error: None,
          is_stale: false,
          last_fetched: Some(fetched_at),
          source: DataSource::Network,
        });
        Ok(data)
      }
      Err(e) => {
        let err = DataError::network(&e);
        warn!(key = %self.key, error = %err, "fetch failed");
        if let Some(hook) = &self.on_error {
          hook(&err);
        }
        self.serve_degraded(snapshot, err)
      }
    }
  }

  fn serve_offline(
    &self,
    snapshot: Option<Snapshot<T>>,
    is_stale: bool,
  ) -> std::result::Result<T, DataError> {
    if let Some(snapshot) = snapshot {
      self.publish(LoaderState {
        data: Some(snapshot.data.clone()),
        is_loading: false,
        error: None,
        is_stale,
        last_fetched: Some(snapshot.fetched_at),
        source: DataSource::Cache,
      });
      return Ok(snapshot.data);
    }

    if let Some(fallback) = &self.fallback {
      self.publish(LoaderState {
        data: Some(fallback.clone()),
        is_loading: false,
        error: Some(DataError::OfflineFallback),
        is_stale: true,
        last_fetched: None,
        source: DataSource::Fallback,
      });
      return Ok(fallback.clone());
    }

    debug!(key = %self.key, "offline with nothing cached");
    self.publish(LoaderState {
      data: None,
      is_loading: false,
      error: Some(DataError::NoData),
      is_stale: false,
      last_fetched: None,
      source: DataSource::Cache,
    });
    Err(DataError::NoData)
  }

  fn serve_degraded(
    &self,
    snapshot: Option<Snapshot<T>>,
    err: DataError,
  ) -> std::result::Result<T, DataError> {
    if let Some(snapshot) = snapshot {
      self.publish(LoaderState {
        data: Some(snapshot.data.clone()),
        is_loading: false,
        error: Some(err),
        is_stale: true,
        last_fetched: Some(snapshot.fetched_at),
        source: DataSource::Cache,
      });
      return Ok(snapshot.data);
    }

    if let Some(fallback) = &self.fallback {
      self.publish(LoaderState {
        data: Some(fallback.clone()),
        is_loading: false,
        error: Some(err),
        is_stale: true,
        last_fetched: None,
        source: DataSource::Fallback,
      });
      return Ok(fallback.clone());
    }

    self.publish(LoaderState {
      data: None,
      is_loading: false,
      error: Some(err.clone()),
      is_stale: false,
      last_fetched: None,
      source: DataSource::Network,
    });
    Err(err)
  }

  fn publish(&self, state: LoaderState<T>) {
    if !self.mounted.load(Ordering::SeqCst) {
      trace!(key = %self.key, "loader dropped, not publishing");
      return;
    }
    self.state_tx.send_replace(state);
  }

  /// Served cached data together with an error: worth another try once online.
  fn wants_resume(&self) -> bool {
    let state = self.state_tx.borrow();
    state.source == DataSource::Cache && state.error.is_some()
  }

  fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight<T>>> {
    self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Loader for one query key. See the module docs for the serving policy.
///
/// Overlapping `load` calls share a single fetch. Dropping the loader stops
/// state updates and the reconnect watcher.
pub struct DataLoader<T> {
  inner: Arc<LoaderInner<T>>,
  resume_task: JoinHandle<()>,
}

impl<T> DataLoader<T>
where
  T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
  /// Create a loader. Must be called inside a tokio runtime, which runs the
  /// reconnect watcher.
  pub fn new<F, Fut>(
    options: LoaderOptions<T>,
    fetcher: F,
    snapshots: SnapshotStore,
    connectivity: watch::Receiver<ConnectivityState>,
    clock: SharedClock,
  ) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let (state_tx, _) = watch::channel(LoaderState::default());
    let inner = Arc::new(LoaderInner {
      key: options.key,
      ttl: options.ttl,
      fallback: options.fallback,
      on_error: options.on_error,
      fetcher: Box::new(move || Box::pin(fetcher())),
      snapshots,
      connectivity,
      clock,
      state_tx,
      in_flight: Mutex::new(None),
      next_flight: AtomicU64::new(0),
      mounted: AtomicBool::new(true),
    });

    // Take the baseline now: a reconnect can land before the task first runs
    let mut connectivity = inner.connectivity.clone();
    let was_offline = connectivity.borrow_and_update().is_offline;
    let resume_task = spawn_resume_on_reconnect(Arc::downgrade(&inner), connectivity, was_offline);

    Self { inner, resume_task }
  }

  pub fn key(&self) -> &str {
    &self.inner.key
  }

  /// Resolve data for this key. Returns an error only when no network, cached
  /// or fallback data could be produced.
  ///
  /// The returned future does not borrow the loader and keeps running if the
  /// loader is dropped, without publishing its result.
  pub fn load(
    &self,
    force_refresh: bool,
  ) -> impl Future<Output = std::result::Result<T, DataError>> + Send + 'static {
    self.inner.load(force_refresh)
  }

  /// Bypass a fresh snapshot and go to the network.
  pub fn refresh(&self) -> impl Future<Output = std::result::Result<T, DataError>> + Send + 'static {
    self.load(true)
  }

  /// Forget this key's snapshot. Other keys are untouched.
  pub fn clear_cache(&self) {
    self.inner.snapshots.remove(&self.inner.key);
  }

  pub fn state(&self) -> LoaderState<T> {
    self.inner.state_tx.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<LoaderState<T>> {
    self.inner.state_tx.subscribe()
  }

  /// Online and not already loading.
  pub fn can_refresh(&self) -> bool {
    self.inner.connectivity.borrow().is_online && !self.inner.state_tx.borrow().is_loading
  }
}

impl<T> Drop for DataLoader<T> {
  fn drop(&mut self) {
    self.inner.mounted.store(false, Ordering::SeqCst);
    self.resume_task.abort();
    // Break the cycle between the loader and a load nobody is polling
    self
      .inner
      .in_flight
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
  }
}

fn spawn_resume_on_reconnect<T>(
  inner: Weak<LoaderInner<T>>,
  mut connectivity: watch::Receiver<ConnectivityState>,
  mut was_offline: bool,
) -> JoinHandle<()>
where
  T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
  tokio::spawn(async move {
    while connectivity.changed().await.is_ok() {
      let is_offline = connectivity.borrow_and_update().is_offline;
      let reconnected = was_offline && !is_offline;
      was_offline = is_offline;
      if !reconnected {
        continue;
      }

      let Some(loader) = inner.upgrade() else {
        break;
      };
      if loader.wants_resume() {
        info!(key = %loader.key, "connection restored, reloading");
        let _ = loader.load(false).await;
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStore;
  use crate::clock::{Clock, ManualClock};
  use crate::connectivity::{ConnectivityMonitor, LinkEvent, ScriptedProbe};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::AtomicUsize;

  struct Harness {
    clock: Arc<ManualClock>,
    monitor: Arc<ConnectivityMonitor>,
    snapshots: SnapshotStore,
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
  }

  impl Harness {
    async fn new(online: bool) -> Self {
      let clock = Arc::new(ManualClock::at_epoch());
      let monitor = Arc::new(ConnectivityMonitor::new(
        Arc::new(ScriptedProbe::always(true)),
        clock.clone(),
        std::time::Duration::from_secs(30),
      ));
      monitor.initialize(online).await;

      Self {
        clock,
        monitor,
        snapshots: SnapshotStore::new(Arc::new(MemoryStore::new())),
        calls: Arc::new(AtomicUsize::new(0)),
        fail: Arc::new(AtomicBool::new(false)),
      }
    }

    fn loader(&self, options: LoaderOptions<String>) -> DataLoader<String> {
      self.loader_with_delay(options, None)
    }

    fn loader_with_delay(
      &self,
      options: LoaderOptions<String>,
      delay: Option<std::time::Duration>,
    ) -> DataLoader<String> {
      let calls = self.calls.clone();
      let fail = self.fail.clone();
      DataLoader::new(
        options,
        move || {
          let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
          let fail = fail.load(Ordering::SeqCst);
          async move {
            if let Some(delay) = delay {
              tokio::time::sleep(delay).await;
            }
            if fail {
              Err(eyre!("connection reset"))
            } else {
              Ok(format!("network-{}", n))
            }
          }
        },
        self.snapshots.clone(),
        self.monitor.subscribe(),
        self.clock.clone(),
      )
    }

    fn seed(&self, key: &str, value: &str, age: Duration) {
      self
        .snapshots
        .save(key, &value.to_string(), self.clock.now() - age);
    }

    fn fetches(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  fn options() -> LoaderOptions<String> {
    LoaderOptions::new("feed:u1:0").with_ttl(Duration::minutes(5))
  }

  #[tokio::test]
  async fn test_offline_without_cache_reports_no_data() {
    let h = Harness::new(false).await;
    let loader = h.loader(options());

    let result = loader.load(false).await;
    assert_eq!(result, Err(DataError::NoData));

    let state = loader.state();
    assert!(state.data.is_none());
    assert_eq!(state.error, Some(DataError::NoData));
    assert!(!state.is_loading);
    assert_eq!(h.fetches(), 0);
  }

  #[tokio::test]
  async fn test_offline_serves_cache_without_fetching() {
    let h = Harness::new(false).await;
    h.seed("feed:u1:0", "cached", Duration::minutes(1));
    let loader = h.loader(options());

    assert_eq!(loader.load(false).await.unwrap(), "cached");
    let state = loader.state();
    assert_eq!(state.source, DataSource::Cache);
    assert!(!state.is_stale);
    assert!(state.error.is_none());
    assert_eq!(h.fetches(), 0);
  }

  #[tokio::test]
  async fn test_offline_stale_cache_is_marked_stale() {
    let h = Harness::new(false).await;
    h.seed("feed:u1:0", "old", Duration::minutes(30));
    let loader = h.loader(options());

    assert_eq!(loader.load(true).await.unwrap(), "old");
    assert!(loader.state().is_stale);
    assert_eq!(h.fetches(), 0);
  }

  #[tokio::test]
  async fn test_offline_uses_fallback() {
    let h = Harness::new(false).await;
    let loader = h.loader(options().with_fallback("placeholder".to_string()));

    assert_eq!(loader.load(false).await.unwrap(), "placeholder");
    let state = loader.state();
    assert!(state.is_from_fallback());
    assert!(state.is_stale);
    assert_eq!(state.error, Some(DataError::OfflineFallback));
  }

  #[tokio::test]
  async fn test_online_fresh_cache_skips_network() {
    let h = Harness::new(true).await;
    h.seed("feed:u1:0", "cached", Duration::minutes(1));
    let loader = h.loader(options());

    assert_eq!(loader.load(false).await.unwrap(), "cached");
    let state = loader.state();
    assert!(state.is_from_cache());
    assert!(!state.is_stale);
    assert_eq!(h.fetches(), 0);
  }

  #[tokio::test]
  async fn test_online_stale_cache_fetches() {
    let h = Harness::new(true).await;
    h.seed("feed:u1:0", "old", Duration::minutes(10));
    let loader = h.loader(options());

    assert_eq!(loader.load(false).await.unwrap(), "network-1");
    let state = loader.state();
    assert!(state.is_from_network());
    assert!(!state.is_stale);
    assert_eq!(state.last_fetched, Some(h.clock.now()));

    // Snapshot was refreshed
    let snapshot: Snapshot<String> = h.snapshots.load("feed:u1:0").unwrap();
    assert_eq!(snapshot.data, "network-1");
  }

  #[tokio::test]
  async fn test_refresh_bypasses_fresh_cache() {
    let h = Harness::new(true).await;
    h.seed("feed:u1:0", "cached", Duration::seconds(5));
    let loader = h.loader(options());

    assert_eq!(loader.refresh().await.unwrap(), "network-1");
    assert_eq!(h.fetches(), 1);
  }

  #[tokio::test]
  async fn test_failed_fetch_degrades_to_stale_cache() {
    let h = Harness::new(true).await;
    h.seed("feed:u1:0", "old", Duration::hours(2));
    h.fail.store(true, Ordering::SeqCst);

    let errors = Arc::new(AtomicUsize::new(0));
    let seen = errors.clone();
    let loader = h.loader(options().on_error(move |_| {
      seen.fetch_add(1, Ordering::SeqCst);
    }));

    assert_eq!(loader.load(false).await.unwrap(), "old");
    let state = loader.state();
    assert!(state.is_from_cache());
    assert!(state.is_stale);
    assert!(matches!(state.error, Some(DataError::Network(_))));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_failed_fetch_uses_fallback() {
    let h = Harness::new(true).await;
    h.fail.store(true, Ordering::SeqCst);
    let loader = h.loader(options().with_fallback("placeholder".to_string()));

    assert_eq!(loader.load(false).await.unwrap(), "placeholder");
    let state = loader.state();
    assert!(state.is_from_fallback());
    assert!(state.is_stale);
    assert!(state.error.is_some());
  }

  #[tokio::test]
  async fn test_failed_fetch_without_any_data_errors() {
    let h = Harness::new(true).await;
    h.fail.store(true, Ordering::SeqCst);
    let loader = h.loader(options());

    let err = loader.load(false).await.unwrap_err();
    assert!(err.is_network());
    let state = loader.state();
    assert!(state.data.is_none());
    assert!(state.is_from_network());
    assert_eq!(state.error, Some(err));
  }

  #[tokio::test]
  async fn test_clear_cache_only_touches_own_key() {
    let h = Harness::new(false).await;
    h.seed("feed:u1:0", "mine", Duration::zero());
    h.seed("feed:u2:0", "theirs", Duration::zero());
    let loader = h.loader(options());

    loader.clear_cache();
    assert!(h.snapshots.load::<String>("feed:u1:0").is_none());
    assert!(h.snapshots.load::<String>("feed:u2:0").is_some());
  }

  #[tokio::test]
  async fn test_overlapping_loads_share_one_fetch() {
    let h = Harness::new(true).await;
    let loader = h.loader_with_delay(options(), Some(std::time::Duration::from_millis(50)));

    let (a, b, c) = tokio::join!(loader.refresh(), loader.load(false), loader.refresh());
    assert_eq!(a.unwrap(), "network-1");
    assert_eq!(b.unwrap(), "network-1");
    assert_eq!(c.unwrap(), "network-1");
    assert_eq!(h.fetches(), 1);

    // A later call starts a new fetch
    loader.refresh().await.unwrap();
    assert_eq!(h.fetches(), 2);
  }

  #[tokio::test]
  async fn test_refresh_does_not_join_cache_read() {
    let h = Harness::new(true).await;
    h.seed("feed:u1:0", "cached", Duration::seconds(5));
    let loader = h.loader(options());

    let (load, refresh) = tokio::join!(loader.load(false), loader.refresh());
    assert_eq!(load.unwrap(), "cached");
    assert_eq!(refresh.unwrap(), "network-1");
    assert_eq!(h.fetches(), 1);
    assert!(loader.state().is_from_network());
  }

  async fn wait_for_network(rx: &mut watch::Receiver<LoaderState<String>>) -> LoaderState<String> {
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
      loop {
        rx.changed().await.unwrap();
        let state = rx.borrow_and_update().clone();
        if state.is_from_network() && state.data.is_some() {
          return state;
        }
      }
    })
    .await
    .unwrap()
  }

  #[tokio::test]
  async fn test_degraded_fetch_resumes_after_outage() {
    let h = Harness::new(true).await;
    h.seed("feed:u1:0", "old", Duration::hours(1));
    h.fail.store(true, Ordering::SeqCst);
    let loader = h.loader(options());
    let mut rx = loader.subscribe();

    assert_eq!(loader.load(false).await.unwrap(), "old");
    let state = rx.borrow_and_update().clone();
    assert!(state.is_from_cache());
    assert!(state.is_stale);
    assert!(matches!(state.error, Some(DataError::Network(_))));

    h.monitor.handle_link_event(LinkEvent::Down).await;
    tokio::task::yield_now().await;
    h.fail.store(false, Ordering::SeqCst);
    h.monitor.handle_link_event(LinkEvent::Up).await;

    let state = wait_for_network(&mut rx).await;
    assert_eq!(state.data.as_deref(), Some("network-2"));
    assert!(!state.is_stale);
    assert!(state.error.is_none());
    assert_eq!(h.fetches(), 2);
  }

  #[tokio::test]
  async fn test_reload_when_connection_returns() {
    let h = Harness::new(false).await;
    let loader = h.loader(options());
    let mut rx = loader.subscribe();

    // Nothing here yields, so the link comes back before the watcher first runs
    assert!(loader.load(false).await.is_err());
    let _ = rx.borrow_and_update();
    h.monitor.handle_link_event(LinkEvent::Up).await;

    let state = wait_for_network(&mut rx).await;

    assert_eq!(state.data.as_deref(), Some("network-1"));
    assert!(state.is_from_network());
    assert!(state.error.is_none());
  }

  #[tokio::test]
  async fn test_no_reload_when_cache_served_cleanly() {
    let h = Harness::new(false).await;
    h.seed("feed:u1:0", "cached", Duration::minutes(1));
    let loader = h.loader(options());
    loader.load(false).await.unwrap();

    h.monitor.handle_link_event(LinkEvent::Up).await;
    tokio::task::yield_now().await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(h.fetches(), 0);
  }

  #[tokio::test]
  async fn test_dropped_loader_stops_publishing() {
    let h = Harness::new(true).await;
    let loader = h.loader_with_delay(options(), Some(std::time::Duration::from_millis(50)));
    let rx = loader.subscribe();

    let pending = loader.load(false);
    drop(loader);
    assert_eq!(pending.await.unwrap(), "network-1");

    // The fetch completed, but nobody was told
    assert!(rx.borrow().data.is_none());
  }

  #[tokio::test]
  async fn test_can_refresh() {
    let h = Harness::new(true).await;
    let loader = h.loader(options());
    assert!(loader.can_refresh());

    h.monitor.handle_link_event(LinkEvent::Down).await;
    assert!(!loader.can_refresh());
  }
}
