//! Bounded exponential backoff.
//!
//! After `k` consecutive failures the next attempt waits
//! `min(max, base * 2^k)`.

use std::time::Duration;

/// Default base retry interval
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(5);

/// Default retry interval cap
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(300);

/// Retry delay policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_BASE, DEFAULT_RETRY_MAX)
    }
}

impl BackoffPolicy {
    /// Creates a policy; `max` is raised to `base` if smaller.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before the next attempt after `failures` consecutive failures
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use geo_uplink::uplink::BackoffPolicy;
    ///
    /// let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10));
    /// assert_eq!(policy.delay(1), Duration::from_secs(2));
    /// assert_eq!(policy.delay(3), Duration::from_secs(8));
    /// assert_eq!(policy.delay(4), Duration::from_secs(10));
    /// ```
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}
