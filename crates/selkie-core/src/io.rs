//! I/O abstraction layer
//!
//! TigerStyle: All external I/O goes through abstraction traits.
//!
//! Placement logic must behave identically under test and in production,
//! so the two non-deterministic inputs — time and randomness — are
//! injected:
//!
//! - **Time**: wall clock vs. manually advanced mock clock
//! - **Random**: seeded xorshift vs. time-seeded xorshift
//!
//! The same business logic code runs in both modes; only the provider
//! implementations differ. Never call `SystemTime::now()` or spawn
//! timers directly from placement code.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

// ============================================================================
// Time Provider
// ============================================================================

/// Time provider abstraction
///
/// # Implementations
///
/// - [`WallClockTime`]: production — uses the system clock
/// - [`MockClock`]: tests — deterministic, manually advanced
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Get current time in milliseconds since epoch
    fn now_ms(&self) -> u64;

    /// Sleep for the specified duration
    ///
    /// In production: actual tokio::time::sleep.
    /// Under a mock clock: advances simulated time, returns immediately.
    async fn sleep_ms(&self, ms: u64);

    /// Get monotonic timestamp (for measuring durations)
    fn monotonic_ms(&self) -> u64 {
        self.now_ms()
    }
}

/// Production time provider using wall clock
#[derive(Debug, Clone, Default)]
pub struct WallClockTime;

impl WallClockTime {
    /// Create a new wall clock time provider
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for WallClockTime {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    async fn sleep_ms(&self, ms: u64) {
        tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
    }
}

/// Mock clock for testing
///
/// Time only moves when the test advances it.
#[derive(Debug)]
pub struct MockClock {
    time_ms: RwLock<u64>,
}

impl MockClock {
    /// Create a new mock clock
    pub fn new(initial_ms: u64) -> Self {
        Self {
            time_ms: RwLock::new(initial_ms),
        }
    }

    /// Advance time by the given milliseconds
    pub async fn advance(&self, ms: u64) {
        let mut time = self.time_ms.write().await;
        *time = time.saturating_add(ms);
    }

    /// Set time to a specific value
    pub async fn set(&self, ms: u64) {
        let mut time = self.time_ms.write().await;
        *time = ms;
    }
}

#[async_trait]
impl TimeProvider for MockClock {
    fn now_ms(&self) -> u64 {
        // Use try_read for sync context, fallback to 0 if contended
        self.time_ms.try_read().map(|t| *t).unwrap_or(0)
    }

    async fn sleep_ms(&self, ms: u64) {
        // In mock mode, sleeping just advances time
        self.advance(ms).await;
    }
}

// ============================================================================
// RNG Provider
// ============================================================================

/// Random number generator abstraction
///
/// # Implementations
///
/// - [`StdRngProvider`]: production — time-seeded xorshift
/// - [`StdRngProvider::with_seed`]: tests — fixed seed, reproducible
pub trait RngProvider: Send + Sync + std::fmt::Debug {
    /// Generate a random u64
    fn next_u64(&self) -> u64;

    /// Generate a random f64 in [0, 1)
    fn next_f64(&self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Generate random u64 in range [min, max)
    fn gen_range(&self, min: u64, max: u64) -> u64 {
        assert!(min < max, "min must be less than max");
        let range = max - min;
        min + (self.next_u64() % range)
    }

    /// Generate random boolean with given probability of true
    fn gen_bool(&self, probability: f64) -> bool {
        assert!(
            (0.0..=1.0).contains(&probability),
            "probability must be in [0, 1]"
        );
        self.next_f64() < probability
    }

    /// Generate a random lock token as a hex string
    fn gen_token(&self) -> String {
        format!("{:016x}{:016x}", self.next_u64(), self.next_u64())
    }
}

/// Production RNG provider
///
/// Uses an atomic counter for thread-safety without locks.
/// Not cryptographically secure - use for non-security randomness only.
#[derive(Debug)]
pub struct StdRngProvider {
    state: AtomicU64,
}

impl Default for StdRngProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StdRngProvider {
    /// Create a new RNG provider seeded from system time
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        Self {
            state: AtomicU64::new(seed | 1),
        }
    }

    /// Create with specific seed (for testing)
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: AtomicU64::new(seed | 1),
        }
    }
}

impl RngProvider for StdRngProvider {
    fn next_u64(&self) -> u64 {
        // Simple xorshift64* algorithm
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            let mut x = state;
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;
            let new_state = x;

            match self.state.compare_exchange_weak(
                state,
                new_state,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return x.wrapping_mul(0x2545F4914F6CDD1D),
                Err(s) => state = s,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_clock_now() {
        let clock = WallClockTime::new();
        let t1 = clock.now_ms();
        assert!(t1 > 0);
    }

    #[tokio::test]
    async fn test_mock_clock_advance() {
        let clock = MockClock::new(1000);
        assert_eq!(clock.now_ms(), 1000);

        clock.advance(500).await;
        assert_eq!(clock.now_ms(), 1500);

        clock.set(10_000).await;
        assert_eq!(clock.now_ms(), 10_000);
    }

    #[tokio::test]
    async fn test_mock_clock_sleep_advances() {
        let clock = MockClock::new(0);
        clock.sleep_ms(250).await;
        assert_eq!(clock.now_ms(), 250);
    }

    #[test]
    fn test_rng_deterministic_with_seed() {
        let a = StdRngProvider::with_seed(42);
        let b = StdRngProvider::with_seed(42);

        for _ in 0..10 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn test_rng_gen_range() {
        let rng = StdRngProvider::with_seed(7);
        for _ in 0..100 {
            let v = rng.gen_range(10, 20);
            assert!((10..20).contains(&v));
        }
    }

    #[test]
    fn test_rng_gen_token_format() {
        let rng = StdRngProvider::with_seed(7);
        let token = rng.gen_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
