/// Shared HTTP plumbing for the hosted APIs
///
/// One `reqwest::Client` with extended timeouts is built at startup and
/// shared by every service client. Requests go through [`send_with_retry`],
/// which retries transient failures (network errors, HTTP 429, HTTP 5xx)
/// with exponential backoff and fails fast on everything else.
use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use tokio::time::sleep;

use crate::config::Config;
use crate::error::{BotError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.http_max_retries,
            base_delay: Duration::from_secs(1),
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt.saturating_sub(1).min(5))
    }
}

/// Build the HTTP client used for every outbound API call
pub fn build_http_client(config: &Config) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;

    reqwest::Client::builder()
        .timeout(config.http_timeout)
        .connect_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .build()
        .context("Failed to create HTTP client")
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Send a request, retrying transient failures
///
/// `build` is called once per attempt because request bodies (multipart in
/// particular) cannot be reused. Non-success responses are turned into
/// `BotError::ExternalService` carrying the response body.
pub async fn send_with_retry<F>(
    service: &'static str,
    policy: RetryPolicy,
    build: F,
) -> Result<Response>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let last_attempt = attempt > policy.max_retries;

        match build().send().await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => {
                let status = response.status();
                if is_retryable_status(status) && !last_attempt {
                    log::warn!(
                        "{} returned {} (attempt {}/{}), retrying",
                        service,
                        status,
                        attempt,
                        policy.max_retries + 1
                    );
                } else {
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unable to read error response".to_string());
                    return Err(BotError::external(
                        service,
                        format!("status {}: {}", status, body),
                    ));
                }
            }
            Err(e) => {
                if last_attempt || !(e.is_timeout() || e.is_connect() || e.is_request()) {
                    return Err(BotError::external(service, e.to_string()));
                }
                log::warn!(
                    "{} request failed (attempt {}/{}): {}",
                    service,
                    attempt,
                    policy.max_retries + 1,
                    e
                );
            }
        }

        sleep(policy.delay_for(attempt)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(20), Duration::from_millis(3200));
    }
}
