//! Bounded, user-triggered retry around an async operation.
//!
//! # Example
//!
//! ```ignore
//! let client = backend.clone();
//! let mut upload = Retryable::new(move || {
//!   let client = client.clone();
//!   async move { client.get_photo("p1").await }
//! })
//! .with_options(RetryOptions::default());
//!
//! if upload.execute().await.is_err() && upload.can_retry() {
//!   // Behind a "Try again" button
//!   upload.retry().await?;
//! }
//! ```

use color_eyre::{Report, Result};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
  pub max_retries: u32,
  #[serde(rename = "retry_delay_ms", with = "millis")]
  pub retry_delay: Duration,
}

impl Default for RetryOptions {
  fn default() -> Self {
    Self {
      max_retries: 3,
      retry_delay: Duration::from_millis(1000),
    }
  }
}

mod millis {
  use serde::{Deserialize, Deserializer};
  use std::time::Duration;

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryState<T> {
  pub data: Option<T>,
  pub is_loading: bool,
  pub error: Option<String>,
  pub retry_count: u32,
}

impl<T> Default for RetryState<T> {
  fn default() -> Self {
    Self {
      data: None,
      is_loading: false,
      error: None,
      retry_count: 0,
    }
  }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

type OperationFn<T> = Box<dyn Fn() -> BoxFuture<T> + Send + Sync>;

type ErrorHook = Box<dyn Fn(&Report, u32) + Send + Sync>;

type SuccessHook = Box<dyn Fn() + Send + Sync>;

/// An async operation that can be re-run a limited number of times.
///
/// `execute` always starts over with a zero retry count; `retry` waits the
/// configured delay and runs again, counting attempts up to `max_retries`.
/// Both return failures to the caller.
pub struct Retryable<T> {
  operation: OperationFn<T>,
  options: RetryOptions,
  state: RetryState<T>,
  on_error: Option<ErrorHook>,
  on_success: Option<SuccessHook>,
}

impl<T: Clone + Send + 'static> Retryable<T> {
  pub fn new<F, Fut>(operation: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    Self {
      operation: Box::new(move || Box::pin(operation())),
      options: RetryOptions::default(),
      state: RetryState::default(),
      on_error: None,
      on_success: None,
    }
  }

  pub fn with_options(mut self, options: RetryOptions) -> Self {
    self.options = options;
    self
  }

  /// Called with the error and the retry count of the failed attempt.
  pub fn on_error<F>(mut self, hook: F) -> Self
  where
    F: Fn(&Report, u32) + Send + Sync + 'static,
  {
    self.on_error = Some(Box::new(hook));
    self
  }

  pub fn on_success<F>(mut self, hook: F) -> Self
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.on_success = Some(Box::new(hook));
    self
  }

  pub fn state(&self) -> &RetryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data.as_ref()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error.as_deref()
  }

  pub fn retry_count(&self) -> u32 {
    self.state.retry_count
  }

  /// Run the operation from scratch.
  pub async fn execute(&mut self) -> Result<T> {
    self.run(0).await
  }

  /// Wait `retry_delay` and run again. Returns `Ok(None)` without running
  /// anything once `max_retries` attempts have been made.
  pub async fn retry(&mut self) -> Result<Option<T>> {
    if self.is_max_retries_reached() {
      debug!(
        max_retries = self.options.max_retries,
        "retry budget exhausted, ignoring"
      );
      return Ok(None);
    }

    if !self.options.retry_delay.is_zero() {
      tokio::time::sleep(self.options.retry_delay).await;
    }

    let attempt = self.state.retry_count + 1;
    self.run(attempt).await.map(Some)
  }

  pub fn reset(&mut self) {
    self.state = RetryState::default();
  }

  pub fn can_retry(&self) -> bool {
    self.state.retry_count < self.options.max_retries && self.state.error.is_some()
  }

  pub fn is_max_retries_reached(&self) -> bool {
    self.state.retry_count >= self.options.max_retries
  }

  async fn run(&mut self, retry_count: u32) -> Result<T> {
    self.state.is_loading = true;
    self.state.error = None;
    self.state.retry_count = retry_count;

    match (self.operation)().await {
      Ok(data) => {
        self.state.data = Some(data.clone());
        self.state.is_loading = false;
        if let Some(hook) = &self.on_success {
          hook();
        }
        Ok(data)
      }
      Err(e) => {
        warn!(retry_count, error = %e, "operation failed");
        self.state.is_loading = false;
        self.state.error = Some(format!("{:#}", e));
        if let Some(hook) = &self.on_error {
          hook(&e, retry_count);
        }
        Err(e)
      }
    }
  }
}
