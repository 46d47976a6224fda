//! How often a failed generation call is tried again, and how long to wait.

use std::time::Duration;
use thiserror::Error;

/// Backoff schedule for retrying a generation call.
///
/// The executor consults it only for transient generation errors; a timed
/// out call fails its step without another try.
///
/// # Examples
///
/// ```
/// use parley_core::RetryPolicy;
/// use std::time::Duration;
///
/// // up to 3 more calls, waiting 100ms, 200ms, then 400ms
/// let policy = RetryPolicy::exponential(3, Duration::from_millis(100));
/// assert_eq!(policy.max_retries(), 3);
/// assert_eq!(policy.backoff(1), Some(Duration::from_millis(200)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// The first failure is final.
    #[default]
    None,
    /// The same pause before every retry.
    Fixed { max_retries: u32, delay: Duration },
    /// Pauses that grow by `multiplier` per retry, never above `max_delay`.
    ExponentialBackoff {
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
    },
}

/// A backoff schedule that cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RetryPolicyError(pub &'static str);

const MAX_MULTIPLIER: u32 = 10;

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        RetryPolicy::Fixed { max_retries, delay }
    }

    /// Doubling backoff capped at one minute.
    pub fn exponential(max_retries: u32, initial_delay: Duration) -> Self {
        RetryPolicy::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }

    /// Growing backoff with every knob set by the caller.
    ///
    /// # Errors
    ///
    /// [`RetryPolicyError`] when the multiplier is outside `1..=10` or the
    /// cap is below the first delay.
    pub fn exponential_capped(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
    ) -> Result<Self, RetryPolicyError> {
        match multiplier {
            0 => return Err(RetryPolicyError("backoff multiplier must be at least 1")),
            m if m > MAX_MULTIPLIER => {
                return Err(RetryPolicyError("backoff multiplier must be at most 10"))
            }
            _ => {}
        }
        if max_delay < initial_delay {
            return Err(RetryPolicyError(
                "max backoff must not be shorter than the initial backoff",
            ));
        }
        Ok(RetryPolicy::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay,
            multiplier,
        })
    }

    /// Calls allowed after the first one.
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::Fixed { max_retries, .. }
            | RetryPolicy::ExponentialBackoff { max_retries, .. } => *max_retries,
        }
    }

    /// The same schedule with a step-level retry cap.
    ///
    /// Zero disables retries; a cap on `None` retries without waiting.
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        if max_retries == 0 {
            return RetryPolicy::None;
        }
        let mut policy = match self {
            RetryPolicy::None => return RetryPolicy::fixed(max_retries, Duration::ZERO),
            other => other.clone(),
        };
        if let RetryPolicy::Fixed { max_retries: cap, .. }
        | RetryPolicy::ExponentialBackoff { max_retries: cap, .. } = &mut policy
        {
            *cap = max_retries;
        }
        policy
    }

    /// Pause before retry number `retry`, counted from 0.
    pub fn backoff(&self, retry: u32) -> Option<Duration> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::Fixed { delay, .. } => Some(*delay),
            RetryPolicy::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                ..
            } => {
                let grown = u64::from(*multiplier)
                    .saturating_pow(retry)
                    .saturating_mul(initial_delay.as_millis() as u64);
                let cap = max_delay.as_millis() as u64;
                Some(Duration::from_millis(grown.min(cap)))
            }
        }
    }
}
