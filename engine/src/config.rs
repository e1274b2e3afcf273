//! Engine configuration and retry policies.

use crate::conflict::ConflictPolicy;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether and when a failed operation is attempted again.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Delay before the next try after `attempt` consecutive failures
    /// (1-based), or `None` to give up.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Exponential backoff with optional jitter and a bounded attempt count.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    /// Total tries including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Add up to 25% random jitter
    pub jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// A single try, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Backoff delay for a failure count, ignoring the attempt bound.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter && capped > 0.0 {
            let jitter = rand::thread_rng().gen_range(0.0..=0.25);
            Duration::from_secs_f64(capped * (1.0 + jitter))
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(5)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then(|| self.delay_for_attempt(attempt))
    }
}

/// Tunables for [`RemoteSyncEngine`](crate::RemoteSyncEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Items requested per sync page
    pub sync_page_size: usize,
    /// Upper bound on items fetched per model per sync run
    pub sync_max_records: usize,
    /// Checkpoints older than this are ignored and a full sync runs
    pub full_sync_interval: Duration,
    /// How long to wait for every subscription to be confirmed
    pub subscription_timeout: Duration,
    /// How long `stop()` waits for an in-flight mutation to finish
    pub stop_grace_period: Duration,
    /// Capacity of the lifecycle event channel
    pub event_capacity: usize,
    /// Backoff for transient failures of a single outgoing mutation
    pub mutation_retry: Arc<dyn RetryPolicy>,
    /// Backoff between engine restarts after a retryable phase failure
    pub restart_retry: Arc<dyn RetryPolicy>,
    pub conflict_policy: ConflictPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_page_size: 1000,
            sync_max_records: 10_000,
            full_sync_interval: Duration::from_secs(24 * 60 * 60),
            subscription_timeout: Duration::from_secs(15),
            stop_grace_period: Duration::from_secs(10),
            event_capacity: 256,
            mutation_retry: Arc::new(ExponentialBackoff::default()),
            restart_retry: Arc::new(
                ExponentialBackoff::new(10)
                    .with_initial_delay(Duration::from_secs(1))
                    .with_max_delay(Duration::from_secs(60)),
            ),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sync_page_size(mut self, size: usize) -> Self {
        self.sync_page_size = size.max(1);
        self
    }

    pub fn with_sync_max_records(mut self, max: usize) -> Self {
        self.sync_max_records = max;
        self
    }

    pub fn with_full_sync_interval(mut self, interval: Duration) -> Self {
        self.full_sync_interval = interval;
        self
    }

    pub fn with_subscription_timeout(mut self, timeout: Duration) -> Self {
        self.subscription_timeout = timeout;
        self
    }

    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_mutation_retry(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.mutation_retry = Arc::new(policy);
        self
    }

    pub fn with_restart_retry(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.restart_retry = Arc::new(policy);
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = EngineConfig::new()
            .with_sync_page_size(50)
            .with_sync_max_records(500)
            .with_full_sync_interval(Duration::from_secs(60))
            .with_event_capacity(0);

        assert_eq!(config.sync_page_size, 50);
        assert_eq!(config.sync_max_records, 500);
        assert_eq!(config.full_sync_interval, Duration::from_secs(60));
        assert_eq!(config.event_capacity, 1);
        assert!(matches!(config.conflict_policy, ConflictPolicy::LocalWins));
    }

    #[test]
    fn no_retry_gives_up_immediately() {
        let policy = ExponentialBackoff::no_retry();
        assert_eq!(policy.next_delay(1), None);
    }

    #[test]
    fn backoff_grows_and_is_bounded() {
        let policy = ExponentialBackoff::new(4)
            .with_initial_delay(Duration::from_millis(100))
            .without_jitter();

        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.next_delay(4), None);
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = ExponentialBackoff::new(10).with_initial_delay(Duration::from_millis(100));
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn delay_respects_max() {
        let policy = ExponentialBackoff::new(100)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .without_jitter();

        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }
}
