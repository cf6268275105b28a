// 🌐 HTTP - blocking client with bounded retries
// Retries timeouts, connection failures and 500/502/503/504 only.

use crate::error::{GeozonesError, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::thread;
use std::time::Duration;
use tracing::warn;

const USER_AGENT: &str = concat!("geozones/", env!("CARGO_PKG_VERSION"));

/// Status codes worth retrying
const RETRY_STATUSES: [StatusCode; 4] = [
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

pub fn is_retryable_status(status: StatusCode) -> bool {
    RETRY_STATUSES.contains(&status)
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt)
    }

    /// Run `op`, retrying transient HTTP failures.
    pub fn run<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Err(GeozonesError::Http { message, transient: true }) if attempt < self.retries => {
                    let delay = self.delay(attempt);
                    warn!("{} (retry {}/{} in {:?})", message, attempt + 1, self.retries, delay);
                    thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// JSON-over-HTTP client used by the knowledge-base lookups
pub struct HttpClient {
    client: Client,
    policy: RetryPolicy,
}

impl HttpClient {
    pub fn new(policy: RetryPolicy, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| GeozonesError::Http {
                message: e.to_string(),
                transient: false,
            })?;
        Ok(HttpClient { client, policy })
    }

    /// POST a form and decode the JSON answer
    pub fn post_form(&self, url: &str, form: &[(&str, &str)], accept: &str) -> Result<serde_json::Value> {
        self.policy.run(|| {
            let response = self
                .client
                .post(url)
                .header(reqwest::header::ACCEPT, accept)
                .form(form)
                .send()
                .map_err(|e| GeozonesError::Http {
                    transient: e.is_timeout() || e.is_connect(),
                    message: format!("{}: {}", url, e),
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(GeozonesError::Http {
                    message: format!("{}: HTTP {}", url, status),
                    transient: is_retryable_status(status),
                });
            }

            response.json().map_err(|e| GeozonesError::Http {
                message: format!("{}: malformed response: {}", url, e),
                transient: false,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn instant_policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            backoff: Duration::ZERO,
        }
    }

    fn http_error(transient: bool) -> GeozonesError {
        GeozonesError::Http {
            message: "boom".to_string(),
            transient,
        }
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::GATEWAY_TIMEOUT));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn test_transient_errors_are_retried_until_exhausted() {
        let calls = Cell::new(0);
        let result: Result<()> = instant_policy(3).run(|| {
            calls.set(calls.get() + 1);
            Err(http_error(true))
        });

        assert!(result.is_err());
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_transient_error_then_success() {
        let calls = Cell::new(0);
        let result = instant_policy(3).run(|| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(http_error(true))
            } else {
                Ok(calls.get())
            }
        });

        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_client_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = instant_policy(3).run(|| {
            calls.set(calls.get() + 1);
            Err(http_error(false))
        });

        assert!(matches!(result, Err(GeozonesError::Http { transient: false, .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            retries: 3,
            backoff: Duration::from_millis(200),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(800));
    }
}
