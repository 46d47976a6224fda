//! Retry and timeout discipline around generation calls.

use parley_core::{FlowError, GenerationClient, GenerationRequest, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How a generation call ended. `attempts` counts every call made,
/// including the last one.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Completed { text: String, attempts: u32 },
    /// A non-transient error, or transient errors past the retry cap.
    Failed { error: FlowError, attempts: u32 },
    /// The deadline passed. Never retried.
    TimedOut { error: FlowError, attempts: u32 },
    Cancelled { attempts: u32 },
}

/// Wraps a [`GenerationClient`] with a per-attempt deadline, retries with
/// backoff for transient failures, and cancellation.
///
/// Every wait, whether on the client or on a backoff delay, is abandoned
/// as soon as the token is cancelled.
#[derive(Clone)]
pub struct RetryingGenerator {
    client: Arc<dyn GenerationClient>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl std::fmt::Debug for RetryingGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingGenerator")
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RetryingGenerator {
    pub fn new(client: Arc<dyn GenerationClient>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            client,
            policy,
            timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> GenerationOutcome {
        let max_retries = self.policy.max_retries();
        let mut retry = 0u32;

        loop {
            let attempts = retry + 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return GenerationOutcome::Cancelled { attempts },
                result = timeout(self.timeout, self.client.generate(request)) => result,
            };

            match result {
                Ok(Ok(text)) => return GenerationOutcome::Completed { text, attempts },
                Err(_) => {
                    warn!(attempt = attempts, timeout_ms = self.timeout.as_millis() as u64, "Generation timed out");
                    return GenerationOutcome::TimedOut {
                        error: FlowError::GenerationTimeout(self.timeout),
                        attempts,
                    };
                }
                Ok(Err(error @ FlowError::GenerationTimeout(_))) => {
                    warn!(attempt = attempts, %error, "Generation timed out");
                    return GenerationOutcome::TimedOut { error, attempts };
                }
                Ok(Err(error)) if error.is_transient() && retry < max_retries => {
                    info!(
                        attempt = attempts,
                        max_retries,
                        %error,
                        "Generation failed, retrying"
                    );
                    if let Some(delay) = self.policy.backoff(retry) {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return GenerationOutcome::Cancelled { attempts },
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    retry += 1;
                }
                Ok(Err(error)) => {
                    warn!(attempt = attempts, %error, "Generation failed");
                    return GenerationOutcome::Failed { error, attempts };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        error: FlowError,
    }

    impl Flaky {
        fn new(failures: u32, error: FlowError) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
                error,
            })
        }
    }

    #[async_trait]
    impl GenerationClient for Flaky {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String, FlowError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok("ok".to_string())
            }
        }
    }

    struct Stalled;

    #[async_trait]
    impl GenerationClient for Stalled {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String, FlowError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("late".to_string())
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            role_prompt: "You are terse.".into(),
            messages: Vec::new(),
            timeout: Duration::from_millis(50),
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let client = Flaky::new(2, FlowError::Generation("overloaded".into()));
        let generator = RetryingGenerator::new(
            client.clone(),
            RetryPolicy::fixed(2, Duration::from_millis(1)),
            Duration::from_secs(1),
        );
        let outcome = generator.generate(&request(), &CancellationToken::new()).await;
        assert_eq!(
            outcome,
            GenerationOutcome::Completed {
                text: "ok".into(),
                attempts: 3
            }
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let client = Flaky::new(5, FlowError::Generation("overloaded".into()));
        let generator = RetryingGenerator::new(
            client.clone(),
            RetryPolicy::fixed(1, Duration::ZERO),
            Duration::from_secs(1),
        );
        let outcome = generator.generate(&request(), &CancellationToken::new()).await;
        assert!(matches!(outcome, GenerationOutcome::Failed { attempts: 2, .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let client = Flaky::new(1, FlowError::RoleNotFound("ghost".into()));
        let generator = RetryingGenerator::new(
            client.clone(),
            RetryPolicy::fixed(3, Duration::ZERO),
            Duration::from_secs(1),
        );
        let outcome = generator.generate(&request(), &CancellationToken::new()).await;
        assert!(matches!(outcome, GenerationOutcome::Failed { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_retried() {
        let generator = RetryingGenerator::new(
            Arc::new(Stalled),
            RetryPolicy::fixed(3, Duration::ZERO),
            Duration::from_millis(100),
        );
        let outcome = generator.generate(&request(), &CancellationToken::new()).await;
        assert_eq!(
            outcome,
            GenerationOutcome::TimedOut {
                error: FlowError::GenerationTimeout(Duration::from_millis(100)),
                attempts: 1
            }
        );
    }

    #[tokio::test]
    async fn test_reported_timeout_is_not_retried() {
        let client = Flaky::new(1, FlowError::GenerationTimeout(Duration::from_millis(5)));
        let generator = RetryingGenerator::new(
            client.clone(),
            RetryPolicy::fixed(3, Duration::ZERO),
            Duration::from_secs(1),
        );
        let outcome = generator.generate(&request(), &CancellationToken::new()).await;
        assert!(matches!(outcome, GenerationOutcome::TimedOut { attempts: 1, .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_call() {
        let generator = RetryingGenerator::new(
            Arc::new(Stalled),
            RetryPolicy::None,
            Duration::from_secs(3600),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let outcome = generator.generate(&request(), &cancel).await;
        assert_eq!(outcome, GenerationOutcome::Cancelled { attempts: 1 });
    }
}
