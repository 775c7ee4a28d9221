//! HTTP fetch helper with per-attempt timeout and transient-failure retry.
//!
//! Every REST call the gateway makes goes through [`fetch_with_retry`] so
//! timeout, backoff and `Retry-After` handling stay in one place.

use std::time::Duration;

use {
    reqwest::{RequestBuilder, Response},
    tracing::debug,
};

/// Statuses worth retrying: rate limit and upstream hiccups.
pub const DEFAULT_RETRY_STATUSES: [u16; 4] = [429, 502, 503, 504];

/// Ceiling applied to server-supplied `Retry-After` delays.
const RETRY_AFTER_CAP: Duration = Duration::from_secs(30);

/// Base delay for exponential backoff between attempts.
const BACKOFF_BASE_MS: u64 = 500;

/// Options for a retried fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Bounds every single attempt; the in-flight request is aborted when it
    /// elapses.
    pub timeout: Duration,
    /// Additional attempts after the first.
    pub retries: u32,
    /// Response statuses treated as transient.
    pub retry_on: Vec<u16>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: 2,
            retry_on: DEFAULT_RETRY_STATUSES.to_vec(),
        }
    }
}

impl FetchOptions {
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Execute a request with up to `retries + 1` attempts.
///
/// Retries on statuses in `retry_on` (honoring `Retry-After`, capped at
/// 30 s) and on transient errors — timeouts, connection failures, and
/// low-level I/O errors recognized by keyword. On exhaustion with a
/// retriable status the last response is returned, not an error; on
/// exhaustion after transient errors the last error is returned.
/// Non-transient errors are returned immediately.
pub async fn fetch_with_retry(
    builder: RequestBuilder,
    opts: &FetchOptions,
) -> reqwest::Result<Response> {
    let total_attempts = opts.retries.saturating_add(1);

    if builder.try_clone().is_none() {
        // Streaming bodies cannot be replayed; single attempt only.
        return builder.timeout(opts.timeout).send().await;
    }

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let Some(this) = builder.try_clone() else {
            break;
        };

        match this.timeout(opts.timeout).send().await {
            Ok(resp) => {
                let status = resp.status();
                if opts.retry_on.contains(&status.as_u16()) && attempt < total_attempts {
                    let delay = retry_delay(Some(&resp), attempt);
                    debug!(
                        status = status.as_u16(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retriable status, backing off"
                    );
                    // Drain the body so the connection is free during backoff.
                    let _ = resp.bytes().await;
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(resp);
            },
            Err(err) => {
                if is_transient_error(&err) && attempt < total_attempts {
                    let delay = retry_delay(None, attempt);
                    debug!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "transient fetch error, backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(err);
            },
        }
    }

    // try_clone failed mid-loop; fall back to one unretried attempt.
    builder.timeout(opts.timeout).send().await
}

/// Delay before the next attempt: server-supplied `Retry-After` when present
/// and positive, else exponential backoff.
fn retry_delay(resp: Option<&Response>, attempt: u32) -> Duration {
    if let Some(resp) = resp
        && let Some(value) = resp.headers().get(reqwest::header::RETRY_AFTER)
        && let Ok(text) = value.to_str()
        && let Ok(seconds) = text.trim().parse::<u64>()
        && seconds > 0
    {
        return Duration::from_secs(seconds).min(RETRY_AFTER_CAP);
    }
    Duration::from_millis(BACKOFF_BASE_MS << (attempt.saturating_sub(1).min(16)))
}

/// Whether an error is worth retrying.
///
/// Timeouts (our own per-attempt abort) and connection-level failures are
/// transient; so is anything whose error chain names a network condition.
/// Everything else — a programming bug surfacing as a request error, say —
/// is returned immediately.
fn is_transient_error(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }

    const KEYWORDS: [&str; 6] = ["fetch", "network", "econnr", "etimedout", "enotfound", "socket"];

    let mut text = err.to_string().to_lowercase();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        text.push(' ');
        text.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }
    KEYWORDS.iter().any(|kw| text.contains(kw))
}
