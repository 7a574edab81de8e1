// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::Rng;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;

/// How retry delays grow between attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackoffStrategy {
    Constant,
    Linear,
    Exponential,

    /// Exponential with uniform noise to avoid thundering herds.
    ExponentialJitter,
}

type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;
type RetryHook = Arc<dyn Fn(u32, &Error, Duration) + Send + Sync>;

/// Configurable retry policy for connection operations.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts; zero disables retrying entirely.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub initial_delay: Duration,

    /// Ceiling applied to every computed delay.
    pub max_delay: Duration,

    /// Base of the exponential growth curve.
    pub exponential_base: f64,

    pub backoff_strategy: BackoffStrategy,

    /// Overrides the error classifier when present.
    retry_condition: Option<RetryPredicate>,

    /// Called before sleeping, with the attempt, error and delay.
    on_retry: Option<RetryHook>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy {
    /// Aggressive preset for critical operations.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            exponential_base: 1.5,
            backoff_strategy: BackoffStrategy::ExponentialJitter,
            retry_condition: None,
            on_retry: None,
        }
    }

    /// Standard preset for normal operations.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            backoff_strategy: BackoffStrategy::ExponentialJitter,
            retry_condition: None,
            on_retry: None,
        }
    }

    /// Conservative preset to avoid overloading a struggling server.
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            exponential_base: 3.0,
            backoff_strategy: BackoffStrategy::Exponential,
            retry_condition: None,
            on_retry: None,
        }
    }

    /// Fail immediately without retrying.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential_base: 2.0,
            backoff_strategy: BackoffStrategy::Constant,
            retry_condition: None,
            on_retry: None,
        }
    }

    /// Replace the error classifier with a custom predicate.
    #[must_use]
    pub fn with_retry_condition(
        mut self,
        condition: impl Fn(&Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_condition = Some(Arc::new(condition));
        self
    }

    /// Install a hook invoked before each retry sleep.
    #[must_use]
    pub fn with_on_retry(
        mut self,
        hook: impl Fn(u32, &Error, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Decide whether `error` on 1-based attempt `attempt` is retried.
    #[must_use]
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match &self.retry_condition {
            Some(condition) => condition(error),
            None => error.is_retryable(),
        }
    }

    /// Delay following 1-based attempt `attempt`, before the next one.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let initial = self.initial_delay.as_secs_f64();
        let delay = match self.backoff_strategy {
            BackoffStrategy::Constant => initial,
            BackoffStrategy::Linear => initial * f64::from(attempt),
            BackoffStrategy::Exponential => {
                initial * self.exponential_base.powi(attempt as i32 - 1)
            }
            BackoffStrategy::ExponentialJitter => {
                let base = initial * self.exponential_base.powi(attempt as i32 - 1);
                base + rand::thread_rng().gen_range(0.0..=base * 0.1)
            }
        };
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Run `operation` until it succeeds or the policy gives up.
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted or the error
    /// is classified non-retryable.
    pub async fn execute_with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !self.should_retry(&error, attempt) {
                        return Err(error);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    if let Some(hook) = &self.on_retry {
                        hook(attempt, &error, delay);
                    }
                    log::warn!(
                        "Retry {attempt}/{attempts} after {delay:?}, error: {error}",
                    );
                    last_error = Some(error);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        match last_error {
            Some(error) => Err(error),
            // max_attempts is at least one, so the loop ran and either
            // returned or stored an error.
            None => Err(Error::terminated()),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("exponential_base", &self.exponential_base)
            .field("backoff_strategy", &self.backoff_strategy)
            .finish_non_exhaustive()
    }
}

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakerState {
    /// Calls pass through.
    Closed,

    /// Calls fail fast without attempting.
    Open,

    /// The next call probes whether the target recovered.
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Wrap a callable and fail fast after consecutive failures.
///
/// Closed→Open when the failure count reaches the threshold; Open→HalfOpen
/// once the recovery timeout elapses; HalfOpen returns to Closed on a
/// success and to Open on any failure.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    counts_failure: Option<RetryPredicate>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            counts_failure: None,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Count only errors accepted by `predicate` as breaker failures.
    #[must_use]
    pub fn with_failure_predicate(
        mut self,
        predicate: impl Fn(&Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.counts_failure = Some(Arc::new(predicate));
        self
    }

    /// Execute `operation` under breaker protection.
    ///
    /// # Errors
    ///
    /// Returns a circuit-open error while the breaker rejects calls, or
    /// the operation's own error.
    pub fn call<T>(&self, operation: impl FnOnce() -> Result<T, Error>) -> Result<T, Error> {
        self.before_call()?;
        match operation() {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                self.on_failure(&error);
                Err(error)
            }
        }
    }

    /// Async variant of [`CircuitBreaker::call`].
    ///
    /// # Errors
    ///
    /// Returns a circuit-open error while the breaker rejects calls, or
    /// the operation's own error.
    pub async fn call_async<T, Fut>(
        &self,
        operation: impl FnOnce() -> Fut,
    ) -> Result<T, Error>
    where
        Fut: Future<Output = Result<T, Error>>,
    {
        self.before_call()?;
        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                self.on_failure(&error);
                Err(error)
            }
        }
    }

    /// Current state, advancing Open→HalfOpen if the timeout elapsed.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Manually return to Closed with a clean count.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
    }

    fn before_call(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.state == BreakerState::Open {
            let elapsed_recovery = inner
                .last_failure
                .map_or(false, |at| at.elapsed() >= self.recovery_timeout);
            if elapsed_recovery {
                inner.state = BreakerState::HalfOpen;
            } else {
                return Err(Error::circuit_open(inner.failure_count));
            }
        }
        Ok(())
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
    }

    fn on_failure(&self, error: &Error) {
        if let Some(predicate) = &self.counts_failure {
            if !predicate(error) {
                return;
            }
        }
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        if inner.state == BreakerState::HalfOpen
            || inner.failure_count >= self.failure_threshold
        {
            inner.state = BreakerState::Open;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn retryable() -> Error {
        Error::new(ErrorKind::ServerNotAvailable, "down")
    }

    #[test]
    fn test_exponential_delays_without_jitter() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            backoff_strategy: BackoffStrategy::Exponential,
            ..RetryPolicy::standard()
        };
        // Delays preceding attempts 2 and 3.
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
    }

    #[test]
    fn test_delay_clamped_to_max() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(10),
            exponential_base: 3.0,
            backoff_strategy: BackoffStrategy::Exponential,
            ..RetryPolicy::standard()
        };
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::standard();
        for attempt in 1_u32..=3 {
            let base = Duration::from_secs(1_u64 << (attempt - 1)).as_secs_f64();
            for _ in 0..32 {
                let delay = policy.delay_for_attempt(attempt).as_secs_f64();
                assert!(delay >= base);
                assert!(delay <= base * 1.1 + f64::EPSILON);
            }
        }
    }

    #[test]
    fn test_should_retry_respects_classifier_and_budget() {
        let policy = RetryPolicy::standard();
        assert!(policy.should_retry(&retryable(), 1));
        assert!(policy.should_retry(&retryable(), 2));
        assert!(!policy.should_retry(&retryable(), 3));
        assert!(!policy.should_retry(&Error::new(ErrorKind::Authentication, "no"), 1));
    }

    #[test]
    fn test_custom_retry_condition() {
        let policy = RetryPolicy::standard()
            .with_retry_condition(|error| error.message().contains("flaky"));
        assert!(policy.should_retry(&Error::new(ErrorKind::Authentication, "flaky auth"), 1));
        assert!(!policy.should_retry(&retryable(), 1));
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_after_failures() {
        tokio::time::pause();
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            exponential_base: 2.0,
            backoff_strategy: BackoffStrategy::Constant,
            ..RetryPolicy::standard()
        };
        let counter = std::sync::atomic::AtomicU32::new(0);
        let result = policy
            .execute_with_retry(|| {
                let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(retryable())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_breaker_opens_on_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            let result: Result<(), Error> = breaker.call(|| Err(retryable()));
            assert!(result.is_err());
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        // The next call is rejected without running.
        let result = breaker.call(|| Ok::<_, Error>(1));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::CircuitOpen);
    }

    #[test]
    fn test_breaker_half_open_recovery() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(5));
        let _failed: Result<(), Error> = breaker.call(|| Err(retryable()));
        assert_eq!(breaker.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(10));
        // Probe succeeds, breaker closes and the count resets.
        assert!(breaker.call(|| Ok::<_, Error>(1)).is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_breaker_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(5));
        let _failed: Result<(), Error> = breaker.call(|| Err(retryable()));
        std::thread::sleep(Duration::from_millis(10));
        let _probe: Result<(), Error> = breaker.call(|| Err(retryable()));
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
