use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::{Embedder, GenerationError, Generator};

/// Bounded exponential backoff for transient [`GenerationError`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, given the failure of `attempt`
    /// (1-based).  A provider's `Retry-After` hint wins when longer.
    pub fn delay_for(&self, attempt: u32, error: &GenerationError) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);
        match error {
            GenerationError::RateLimited {
                retry_after: Some(hint),
                ..
            } => backoff.max(*hint).min(self.max_delay),
            _ => backoff,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// is spent.  The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, GenerationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt, &err);
                    warn!(
                        op = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "transient model failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Wraps a [`Generator`] or [`Embedder`] so every call goes through a
/// [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Retrying<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> Retrying<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<G: Generator> Generator for Retrying<G> {
    async fn generate(
        &self,
        prompt: &str,
        system_context: &str,
        temperature: f32,
    ) -> Result<String, GenerationError> {
        let inner = &self.inner;
        self.policy
            .run("generate", || inner.generate(prompt, system_context, temperature))
            .await
    }
}

#[async_trait]
impl<E: Embedder> Embedder for Retrying<E> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GenerationError> {
        let inner = &self.inner;
        self.policy.run("embed", || inner.embed(text)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
        error: GenerationError,
    }

    impl Flaky {
        fn new(failures: u32, error: GenerationError) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                error,
            }
        }
    }

    #[async_trait]
    impl Generator for Flaky {
        async fn generate(&self, _: &str, _: &str, _: f32) -> Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok("recovered".to_string())
        }
    }

    fn timeout() -> GenerationError {
        GenerationError::Timeout {
            provider: "test".into(),
            after: Duration::from_millis(1),
        }
    }

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let generator = Retrying::new(Flaky::new(2, timeout()), fast(3));
        assert_eq!(generator.generate("p", "", 0.5).await.unwrap(), "recovered");
        assert_eq!(generator.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let generator = Retrying::new(Flaky::new(5, timeout()), fast(3));
        let err = generator.generate("p", "", 0.5).await.unwrap_err();
        assert_eq!(err.code(), "timeout");
        assert_eq!(generator.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalid_response_is_not_retried() {
        let generator = Retrying::new(
            Flaky::new(1, GenerationError::InvalidResponse("junk".into())),
            fast(5),
        );
        assert!(generator.generate("p", "", 0.5).await.is_err());
        assert_eq!(generator.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_grows_and_respects_rate_limit_hint() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1, &timeout()), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3, &timeout()), Duration::from_millis(400));

        let limited = GenerationError::RateLimited {
            provider: "test".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(policy.delay_for(1, &limited), Duration::from_secs(2));
    }
}
