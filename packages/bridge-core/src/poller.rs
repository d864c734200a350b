//! Bounded polling with backoff for eventually-consistent reads
//!
//! Used for waiting on register proofs from the relayer backend, indexed
//! transfer records, and chain client connections. A failed fetch is treated
//! as transient and retried with exponential backoff; only an exhausted
//! attempt budget surfaces as an error.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::PollError;

const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const CONNECT_POLL_INTERVAL_MS: u64 = 500;
const CONNECT_MAX_ATTEMPTS: u32 = 20;

/// Polling schedule
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Delay between successful attempts
    pub interval: Duration,
    /// `None` polls until the predicate is satisfied or the caller drops the future
    pub max_attempts: Option<u32>,
    /// Fetch once before the first delay
    pub immediate: bool,
    /// Growth factor applied to the delay after consecutive failed fetches
    pub error_backoff_multiplier: f64,
    /// Cap for the error backoff
    pub max_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            immediate: true,
            error_backoff_multiplier: 2.0,
            max_interval: Duration::from_secs(60),
        }
    }
}

impl PollConfig {
    pub fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts),
            ..Self::default()
        }
    }

    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            ..Self::default()
        }
    }

    /// Schedule for waiting on a chain connection before submitting a call
    pub fn connection() -> Self {
        Self::bounded(
            Duration::from_millis(CONNECT_POLL_INTERVAL_MS),
            CONNECT_MAX_ATTEMPTS,
        )
    }

    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Delay after the `failures`-th consecutive failed fetch (1-based)
    pub fn backoff_for_failure(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.interval.as_secs_f64() * self.error_backoff_multiplier.powi(exponent);
        let cap = self.max_interval.max(self.interval).as_secs_f64();
        Duration::from_secs_f64(secs.min(cap))
    }
}

/// Repeats a fetch until its result no longer asks for another round
#[derive(Debug, Clone, Default)]
pub struct RecordPoller {
    config: PollConfig,
}

impl RecordPoller {
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Call `fetch` with the 1-based attempt number until `keep_polling`
    /// returns false, then return that result.
    ///
    /// When the attempt budget runs out the last successful result is returned
    /// as-is; if the last attempt failed, [`PollError::Exhausted`] is returned.
    /// Dropping the returned future cancels polling.
    pub async fn poll<T, F, Fut, P>(&self, mut fetch: F, mut keep_polling: P) -> Result<T, PollError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = eyre::Result<T>>,
        P: FnMut(&T) -> bool,
    {
        if !self.config.immediate {
            tokio::time::sleep(self.config.interval).await;
        }

        let mut attempt = 0u32;
        let mut failures = 0u32;
        loop {
            attempt += 1;
            let exhausted = self.config.max_attempts.is_some_and(|max| attempt >= max);

            let delay = match fetch(attempt).await {
                Ok(value) => {
                    if !keep_polling(&value) {
                        debug!(attempt, "Poll condition satisfied");
                        return Ok(value);
                    }
                    if exhausted {
                        debug!(attempt, "Poll budget exhausted, returning last result");
                        return Ok(value);
                    }
                    failures = 0;
                    self.config.interval
                }
                Err(e) => {
                    if exhausted {
                        warn!(attempt, error = %e, "Poll budget exhausted");
                        return Err(PollError::Exhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    failures += 1;
                    let backoff = self.config.backoff_for_failure(failures);
                    debug!(
                        attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Poll attempt failed, backing off"
                    );
                    backoff
                }
            };

            tokio::time::sleep(delay).await;
        }
    }
}
