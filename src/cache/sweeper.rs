//! Periodic removal of expired cache entries.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::traits::Sweep;

/// Runs `sweep_expired` on every registered cache at a fixed interval,
/// whether or not the caches are being read.
pub struct CacheSweeper {
  period: Duration,
  caches: Vec<Arc<dyn Sweep>>,
  shutdown_tx: watch::Sender<bool>,
}

impl CacheSweeper {
  pub fn new(period: Duration, caches: Vec<Arc<dyn Sweep>>) -> Self {
    let (shutdown_tx, _) = watch::channel(false);
    Self {
      period,
      caches,
      shutdown_tx,
    }
  }

  /// Sweep every cache once, returning the total number of removed entries.
  pub fn sweep_once(&self) -> usize {
    self
      .caches
      .iter()
      .map(|cache| {
        let removed = cache.sweep_expired();
        if removed > 0 {
          debug!(cache = cache.name(), removed, "swept expired entries");
        }
        removed
      })
      .sum()
  }

  /// Start sweeping in the background until [`shutdown`](Self::shutdown).
  pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
    let mut shutdown_rx = self.shutdown_tx.subscribe();

    tokio::spawn(async move {
      let mut ticker = interval(self.period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately
      ticker.tick().await;

      info!(interval_secs = self.period.as_secs(), "starting cache sweeper");

      loop {
        tokio::select! {
          _ = ticker.tick() => {
            self.sweep_once();
          }
          changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
              info!("cache sweeper shutting down");
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
