use std::time::Duration;

use rand::Rng;
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::warn;

/// Bounded retry with jittered exponential backoff for outbound HTTP calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(250),
      max_delay: Duration::from_secs(10),
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `attempt` (1-based).
  pub fn delay(&self, attempt: u32) -> Duration {
    let exp = self
      .base_delay
      .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let base_ms = self.base_delay.as_millis() as u64;
    let jitter = if base_ms == 0 {
      0
    } else {
      rand::thread_rng().gen_range(0..base_ms)
    };
    exp.saturating_add(Duration::from_millis(jitter)).min(self.max_delay)
  }
}

pub fn is_transient_status(status: StatusCode) -> bool {
  status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_transient_error(err: &reqwest::Error) -> bool {
  err.is_connect() || err.is_timeout()
}

/// Sends `request`, retrying transient failures. The final response is returned as-is,
/// so callers still inspect its status.
pub async fn send(
  request: RequestBuilder,
  policy: &RetryPolicy,
  service: &str,
) -> Result<Response, reqwest::Error> {
  let attempts = policy.max_attempts.max(1);
  let mut attempt = 1;
  loop {
    let retryable = attempt < attempts;
    let current = match request.try_clone() {
      Some(clone) if retryable => clone,
      _ => return request.send().await,
    };

    match current.send().await {
      Ok(resp) if is_transient_status(resp.status()) => {
        warn!("{service} returned {} (attempt {attempt}/{attempts})", resp.status());
      }
      Ok(resp) => return Ok(resp),
      Err(err) if is_transient_error(&err) => {
        warn!("{service} request failed: {err} (attempt {attempt}/{attempts})");
      }
      Err(err) => return Err(err),
    }

    tokio::time::sleep(policy.delay(attempt)).await;
    attempt += 1;
  }
}
