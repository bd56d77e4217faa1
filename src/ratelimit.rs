//! Rate-limited retrying call wrapper
//!
//! One `RateLimiter` guards each remote service. It combines a concurrency gate,
//! a minimum spacing between call starts, and a retry loop that knows the
//! difference between "try again shortly" and "come back at reset time".

use std::future::Future;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::error::{SyncError, SyncResult};

/// Retry behaviour for one limiter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    /// Delay before retry `n` (0-based) is `base_delay * (n + 1)`
    pub base_delay: Duration,
    /// Extra wait after a rate-limit reset time
    pub rate_limit_margin: Duration,
    /// How many rate-limit waits a single call may sit through
    pub max_rate_limit_waits: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            rate_limit_margin: Duration::from_secs(2),
            max_rate_limit_waits: 5,
        }
    }
}

pub struct RateLimiter {
    name: String,
    gate: Semaphore,
    last_call: Mutex<Option<Instant>>,
    min_interval: Duration,
    policy: RetryPolicy,
}

impl RateLimiter {
    pub fn new(name: &str, concurrency: usize, min_interval: Duration, policy: RetryPolicy) -> Self {
        Self {
            name: name.to_string(),
            gate: Semaphore::new(concurrency.max(1)),
            last_call: Mutex::new(None),
            min_interval,
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `op` under the gate and pacing, retrying per the policy.
    ///
    /// `op` is invoked once per attempt. Transient failures back off linearly;
    /// `RateLimited` sleeps until the reported reset and does not count as an
    /// attempt. Anything else is returned immediately.
    pub async fn call<T, F, Fut>(&self, label: &str, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempt: u32 = 0;
        let mut rate_limit_waits: u32 = 0;

        loop {
            let result = {
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|_| SyncError::Fatal(format!("{} limiter closed", self.name)))?;
                self.pace().await;
                op().await
            };

            match result {
                Ok(value) => return Ok(value),
                Err(SyncError::RateLimited { reset_at }) => {
                    rate_limit_waits += 1;
                    if rate_limit_waits > self.policy.max_rate_limit_waits {
                        return Err(SyncError::RetryExceeded {
                            label: label.to_string(),
                            attempts: attempt + 1,
                            last: format!("still rate limited until {}", reset_at),
                        });
                    }
                    let until_reset = (reset_at - chrono::Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    let wait = until_reset + self.policy.rate_limit_margin;
                    tracing::warn!(
                        limiter = %self.name,
                        label,
                        wait_secs = wait.as_secs_f64(),
                        "rate limited, waiting for reset"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) if err.is_transient() => {
                    if attempt >= self.policy.max_retries {
                        return Err(SyncError::RetryExceeded {
                            label: label.to_string(),
                            attempts: attempt + 1,
                            last: err.to_string(),
                        });
                    }
                    let delay = self.policy.base_delay * (attempt + 1);
                    tracing::debug!(
                        limiter = %self.name,
                        label,
                        attempt = attempt + 1,
                        error = %err,
                        "transient failure, backing off {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Hold the pacing lock until `min_interval` has passed since the previous start.
    async fn pace(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
