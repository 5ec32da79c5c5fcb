//! Online/offline state machine.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::events::{LinkEvent, LinkEvents};
use super::probe::Probe;
use crate::clock::SharedClock;

/// Connectivity as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityState {
  pub is_online: bool,
  /// Always `!is_online`
  pub is_offline: bool,
  /// Set by the first offline transition and never cleared for the session
  pub was_offline: bool,
  /// Link reported up but the probe could not reach the backend
  pub is_degraded: bool,
  pub last_online_at: Option<DateTime<Utc>>,
  /// Length of the most recent outage, zero if none was observed
  pub downtime: Duration,
}

impl ConnectivityState {
  /// Optimistic starting state, so nothing flashes "offline" before the first check.
  fn optimistic(now: DateTime<Utc>) -> Self {
    Self {
      is_online: true,
      is_offline: false,
      was_offline: false,
      is_degraded: false,
      last_online_at: Some(now),
      downtime: Duration::zero(),
    }
  }

  pub fn downtime_ms(&self) -> i64 {
    self.downtime.num_milliseconds()
  }

  pub fn downtime_formatted(&self) -> Option<String> {
    if self.downtime > Duration::zero() {
      Some(format_downtime(self.downtime))
    } else {
      None
    }
  }
}

/// Render a duration as `1h 5m`, `3m 20s` or `42s`.
pub fn format_downtime(downtime: Duration) -> String {
  let seconds = downtime.num_seconds();
  let minutes = seconds / 60;
  let hours = minutes / 60;

  if hours > 0 {
    format!("{}h {}m", hours, minutes % 60)
  } else if minutes > 0 {
    format!("{}m {}s", minutes, seconds % 60)
  } else {
    format!("{}s", seconds)
  }
}

struct Inner {
  /// Last link status reported by the platform
  link_up: bool,
  offline_since: Option<DateTime<Utc>>,
  /// Bumped on every link-down; probe results from an older epoch are dropped
  epoch: u64,
  initialized: bool,
}

/// Tracks whether the backend is reachable.
///
/// Link-down events are trusted immediately. Link-up events, manual refreshes
/// and the periodic timer are verified with an active probe.
pub struct ConnectivityMonitor {
  probe: Arc<dyn Probe>,
  clock: SharedClock,
  check_interval: std::time::Duration,
  state_tx: watch::Sender<ConnectivityState>,
  shutdown_tx: watch::Sender<bool>,
  inner: Mutex<Inner>,
}

impl ConnectivityMonitor {
  pub fn new(
    probe: Arc<dyn Probe>,
    clock: SharedClock,
    check_interval: std::time::Duration,
  ) -> Self {
    let (state_tx, _) = watch::channel(ConnectivityState::optimistic(clock.now()));
    let (shutdown_tx, _) = watch::channel(false);

    Self {
      probe,
      clock,
      check_interval,
      state_tx,
      shutdown_tx,
      inner: Mutex::new(Inner {
        link_up: true,
        offline_since: None,
        epoch: 0,
        initialized: false,
      }),
    }
  }

  /// Receive every state change.
  pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
    self.state_tx.subscribe()
  }

  pub fn state(&self) -> ConnectivityState {
    self.state_tx.borrow().clone()
  }

  pub fn is_initialized(&self) -> bool {
    self.lock().initialized
  }

  /// First evaluation. A link reported up is trusted without probing.
  pub async fn initialize(&self, link_up: bool) {
    self.evaluate(link_up, link_up).await;
  }

  pub async fn handle_link_event(&self, event: LinkEvent) {
    debug!(?event, "link event");
    match event {
      LinkEvent::Up => self.evaluate(true, false).await,
      LinkEvent::Down => self.evaluate(false, false).await,
    }
  }

  /// Re-check connectivity now, e.g. behind a user-facing retry button.
  pub async fn refresh_connectivity(&self) -> ConnectivityState {
    let link_up = self.lock().link_up;
    self.evaluate(link_up, false).await;
    self.state()
  }

  /// Timer-driven check: only probes while the monitor believes it is online.
  pub async fn periodic_check(&self) {
    let epoch = {
      let inner = self.lock();
      if !inner.link_up || !inner.initialized || !self.state_tx.borrow().is_online {
        return;
      }
      inner.epoch
    };

    if self.probe.check().await {
      return;
    }

    let mut inner = self.lock();
    if inner.epoch != epoch {
      return;
    }
    warn!("periodic probe failed, going offline");
    self.mark_offline(&mut inner, true);
  }

  async fn evaluate(&self, link_up: bool, skip_probe: bool) {
    let epoch = {
      let mut inner = self.lock();
      inner.link_up = link_up;
      if !link_up {
        inner.epoch += 1;
        self.mark_offline(&mut inner, false);
        inner.initialized = true;
        return;
      }
      inner.epoch
    };

    let reachable = skip_probe || self.probe.check().await;

    let mut inner = self.lock();
    if inner.epoch != epoch {
      debug!("discarding probe result superseded by a link-down");
      return;
    }
    if reachable {
      self.mark_online(&mut inner);
    } else {
      self.mark_offline(&mut inner, true);
    }
    inner.initialized = true;
  }

  fn mark_offline(&self, inner: &mut Inner, degraded: bool) {
    let now = self.clock.now();
    if inner.offline_since.is_none() {
      inner.offline_since = Some(now);
    }

    self.state_tx.send_if_modified(|state| {
      let before = state.clone();
      state.is_online = false;
      state.is_offline = true;
      state.was_offline = true;
      state.is_degraded = degraded;
      if before.is_online {
        info!(degraded, "connectivity lost");
      }
      *state != before
    });
  }

  fn mark_online(&self, inner: &mut Inner) {
    let now = self.clock.now();
    let downtime = inner
      .offline_since
      .take()
      .map(|since| now - since)
      .unwrap_or_else(Duration::zero);

    self.state_tx.send_if_modified(|state| {
      let before = state.clone();
      state.is_online = true;
      state.is_offline = false;
      state.is_degraded = false;
      state.last_online_at = Some(now);
      state.downtime = downtime;
      if before.is_offline {
        info!(downtime_ms = downtime.num_milliseconds(), "connectivity restored");
      }
      *state != before
    });
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Drive the monitor from link events and the periodic timer until
  /// [`shutdown`](Self::shutdown).
  pub fn spawn(self: Arc<Self>, mut events: LinkEvents) -> JoinHandle<()> {
    let mut shutdown_rx = self.shutdown_tx.subscribe();

    tokio::spawn(async move {
      let mut ticker = interval(self.check_interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      ticker.tick().await;
      let mut events_open = true;

      info!(
        interval_secs = self.check_interval.as_secs(),
        "starting connectivity monitor"
      );

      loop {
        tokio::select! {
          _ = ticker.tick() => {
            self.periodic_check().await;
          }
          event = events.next(), if events_open => {
            match event {
              Some(event) => self.handle_link_event(event).await,
              // Keep the timer running without a link source
              None => events_open = false,
            }
          }
          changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
              info!("connectivity monitor shutting down");
              break;
            }
          }
        }
      }
    })
  }

  pub fn shutdown(&self) {
    let _ = self.shutdown_tx.send(true);
  }
}
