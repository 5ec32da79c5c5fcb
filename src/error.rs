use thiserror::Error;

/// Errors surfaced by the data layer.
///
/// `Clone` so the loader can keep the last error in its published state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
  /// Fetch or probe failure. Recoverable: triggers the fallback chain.
  #[error("network error: {0}")]
  Network(String),

  /// Durable persistence failure. Logged by the cache, never shown to users.
  #[error("storage error: {0}")]
  Storage(String),

  /// Offline with no cached snapshot and no fallback data.
  #[error("no cached data available offline")]
  NoData,

  /// Offline and serving configured fallback data.
  #[error("offline - using fallback data")]
  OfflineFallback,
}

impl DataError {
  /// Wrap a fetcher error, keeping the whole context chain.
  pub fn network(err: &color_eyre::Report) -> Self {
    Self::Network(format!("{:#}", err))
  }

  /// Wrap a persistence or encoding failure.
  pub fn storage(err: impl std::fmt::Display) -> Self {
    Self::Storage(format!("{:#}", err))
  }

  pub fn is_network(&self) -> bool {
    matches!(self, Self::Network(_))
  }
}
