//! Time and identity sources for the runtime
//!
//! Two concerns live here: a `TimeProvider` trait that lets tests substitute
//! a delay-skipping clock without conditional compilation, and the process
//! singletons built on top of it: a strictly monotonic [`Clock`] and an
//! [`IdMinter`] whose identifiers sort lexicographically in creation order.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::time::sleep as tokio_sleep;

use crate::domain_types::{ActionId, AgentId, MessageId, Timestamp};

/// Trait for providing time-related functionality
///
/// This allows for dependency injection of time behavior,
/// enabling fast test execution without real-time delays.
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Sleep for the specified duration
    async fn sleep(&self, duration: Duration);

    /// Get the current system time
    #[must_use]
    fn system_now(&self) -> SystemTime;

    /// Get the current instant for measuring elapsed time
    #[must_use]
    fn instant(&self) -> Instant;

    /// Check if we should skip delays (for testing)
    #[must_use]
    fn should_skip_delays(&self) -> bool {
        false
    }
}

/// Real time provider for production use
#[derive(Debug, Clone, Default)]
pub struct RealTimeProvider;

impl RealTimeProvider {
    /// Creates a new real time provider
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for RealTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio_sleep(duration).await;
    }

    fn system_now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Test time provider that collapses delays
///
/// Sleeps complete after at most one millisecond so that backoff and polling
/// loops stay responsive in tests without waiting for real time to pass.
#[derive(Debug, Clone, Default)]
pub struct TestTimeProvider {
    skip_delays: bool,
}

impl TestTimeProvider {
    /// Creates a test time provider that skips delays
    #[must_use]
    pub fn new() -> Self {
        Self { skip_delays: true }
    }

    /// Creates a test time provider that uses real delays
    #[must_use]
    pub fn with_real_delays() -> Self {
        Self { skip_delays: false }
    }
}

#[async_trait]
impl TimeProvider for TestTimeProvider {
    async fn sleep(&self, duration: Duration) {
        if !self.skip_delays {
            tokio_sleep(duration).await;
        } else if duration > Duration::from_millis(1) {
            // Cap at 1ms so concurrent tasks still get a chance to run.
            tokio_sleep(Duration::from_millis(1)).await;
        }
    }

    fn system_now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    fn should_skip_delays(&self) -> bool {
        self.skip_delays
    }
}

/// Type alias for shared time provider
pub type SharedTimeProvider = Arc<dyn TimeProvider>;

/// Strictly monotonic clock for the runtime
///
/// `now()` never returns the same value twice and never goes backwards, even
/// if the underlying system clock is adjusted. Every timestamp attached to a
/// descriptor, message, or action record comes from here.
#[derive(Debug)]
pub struct Clock {
    provider: SharedTimeProvider,
    last_nanos: AtomicU64,
}

impl Clock {
    /// Creates a clock over the given provider.
    #[must_use]
    pub fn new(provider: SharedTimeProvider) -> Self {
        Self {
            provider,
            last_nanos: AtomicU64::new(0),
        }
    }

    /// Returns the current time, strictly greater than any prior return value.
    pub fn now(&self) -> Timestamp {
        let observed = self
            .provider
            .system_now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let observed_nanos = u64::try_from(observed.as_nanos()).unwrap_or(u64::MAX);

        let mut last = self.last_nanos.load(Ordering::Acquire);
        loop {
            let next = observed_nanos.max(last.saturating_add(1));
            match self.last_nanos.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Timestamp::new(UNIX_EPOCH + Duration::from_nanos(next));
                }
                Err(actual) => last = actual,
            }
        }
    }

    /// Sleeps through the provider, so tests can collapse the delay.
    pub async fn sleep(&self, duration: Duration) {
        self.provider.sleep(duration).await;
    }

    /// Current instant for elapsed-time measurement.
    #[must_use]
    pub fn instant(&self) -> Instant {
        self.provider.instant()
    }

    /// Whether the underlying provider collapses delays.
    #[must_use]
    pub fn skips_delays(&self) -> bool {
        self.provider.should_skip_delays()
    }
}

/// Mints process-unique, creation-ordered identifiers
///
/// Agents, messages, and actions draw from one shared counter, so any two
/// identifiers minted by the same process compare in mint order both
/// numerically and in their textual form.
#[derive(Debug)]
pub struct IdMinter {
    next: AtomicU64,
}

impl IdMinter {
    /// Creates a minter starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates a minter whose first identifier uses `first` as its raw value.
    ///
    /// Used on warm restart to resume above every persisted identifier.
    #[must_use]
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    fn next_raw(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Raises the counter so every future identifier exceeds `raw`.
    ///
    /// Called while adopting persisted identifiers on warm restart.
    pub fn ensure_above(&self, raw: u64) {
        self.next.fetch_max(raw.saturating_add(1), Ordering::Relaxed);
    }

    /// Mints an agent identifier.
    pub fn agent_id(&self) -> AgentId {
        AgentId::new(self.next_raw())
    }

    /// Mints a message identifier.
    pub fn message_id(&self) -> MessageId {
        MessageId::new(self.next_raw())
    }

    /// Mints an action identifier.
    pub fn action_id(&self) -> ActionId {
        ActionId::new(self.next_raw())
    }
}

impl Default for IdMinter {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a production time provider
#[must_use]
pub fn production_time_provider() -> SharedTimeProvider {
    Arc::new(RealTimeProvider::new())
}

/// Create a test time provider that skips delays
#[must_use]
pub fn test_time_provider() -> SharedTimeProvider {
    Arc::new(TestTimeProvider::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_provider_skips_delays() {
        let provider = TestTimeProvider::new();
        let start = Instant::now();

        provider.sleep(Duration::from_secs(10)).await;

        let elapsed = start.elapsed();
        assert!(
            elapsed < Duration::from_millis(100),
            "collapsed sleep took too long: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn real_provider_actually_sleeps() {
        let provider = RealTimeProvider::new();
        let start = Instant::now();

        provider.sleep(Duration::from_millis(50)).await;

        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(50),
            "real sleep was too short: {elapsed:?}"
        );
    }

    #[test]
    fn clock_is_strictly_monotonic() {
        let clock = Clock::new(production_time_provider());
        let mut prev = clock.now();
        for _ in 0..10_000 {
            let next = clock.now();
            assert!(next > prev, "clock went backwards or repeated");
            prev = next;
        }
    }

    #[test]
    fn minted_ids_sort_in_creation_order() {
        let minter = IdMinter::new();
        let first = minter.agent_id();
        let second = minter.agent_id();
        let third = minter.message_id();
        assert!(first < second);
        assert!(second.as_u64() < third.as_u64());
        assert!(first.to_string() < second.to_string());
    }

    #[test]
    fn minter_resumes_above_persisted_ids() {
        let minter = IdMinter::starting_at(100);
        assert_eq!(minter.agent_id().as_u64(), 100);
        assert_eq!(minter.message_id().as_u64(), 101);
    }
}
