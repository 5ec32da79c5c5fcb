//! Active reachability checks.

use async_trait::async_trait;
use reqwest::header::CACHE_CONTROL;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Verifies that the backend is actually reachable.
///
/// Implementations must finish in bounded time. Every failure mode (timeout,
/// refused connection, error status) is reported as `false`.
#[async_trait]
pub trait Probe: Send + Sync {
  async fn check(&self) -> bool;
}

/// Probe issuing a `HEAD` request to a lightweight health endpoint.
#[derive(Clone)]
pub struct HttpProbe {
  client: reqwest::Client,
  url: Url,
  timeout: Duration,
}

impl HttpProbe {
  pub fn new(url: Url, timeout: Duration) -> Self {
    Self {
      client: reqwest::Client::new(),
      url,
      timeout,
    }
  }

  pub fn url(&self) -> &Url {
    &self.url
  }
}

#[async_trait]
impl Probe for HttpProbe {
  async fn check(&self) -> bool {
    let request = self
      .client
      .head(self.url.clone())
      .header(CACHE_CONTROL, "no-cache")
      .send();

    // Dropping the request future on timeout cancels it
    match tokio::time::timeout(self.timeout, request).await {
      Ok(Ok(response)) => {
        let ok = response.status().is_success();
        if !ok {
          debug!(url = %self.url, status = %response.status(), "probe got error status");
        }
        ok
      }
      Ok(Err(e)) => {
        debug!(url = %self.url, error = %e, "probe request failed");
        false
      }
      Err(_) => {
        debug!(url = %self.url, timeout_ms = self.timeout.as_millis() as u64, "probe timed out");
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  async fn probe_for(server: &MockServer, timeout: Duration) -> HttpProbe {
    let url = Url::parse(&format!("{}/api/health", server.uri())).unwrap();
    HttpProbe::new(url, timeout)
  }

  #[tokio::test]
  async fn test_probe_success() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
      .and(path("/api/health"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;

    assert!(probe_for(&server, Duration::from_secs(5)).await.check().await);
  }

  #[tokio::test]
  async fn test_probe_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
      .and(path("/api/health"))
      .respond_with(ResponseTemplate::new(503))
      .mount(&server)
      .await;

    assert!(!probe_for(&server, Duration::from_secs(5)).await.check().await);
  }

  #[tokio::test]
  async fn test_probe_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
      .and(path("/api/health"))
      .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
      .mount(&server)
      .await;

    assert!(!probe_for(&server, Duration::from_millis(50)).await.check().await);
  }

  #[tokio::test]
  async fn test_probe_unreachable() {
    // Nothing listens on port 9 locally
    let probe = HttpProbe::new(
      Url::parse("http://127.0.0.1:9/api/health").unwrap(),
      Duration::from_secs(2),
    );
    assert!(!probe.check().await);
  }
}
