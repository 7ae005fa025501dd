use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Gmail per-user quota: 250 units/second.
pub const DEFAULT_QUOTA_PER_SECOND: i64 = 250;

struct QuotaState {
    available: i64,
    last_refill: Instant,
}

/// Token-bucket limiter for Gmail API quota units.
///
/// One instance is shared (via `Arc`) by every client hitting the same
/// account quota. All state lives behind a single mutex; `acquire` holds the
/// lock across its sleep so concurrent callers serialize their quota
/// decisions instead of double-spending the same units.
pub struct RateLimiter {
    quota_per_second: i64,
    burst_size: i64,
    state: Mutex<QuotaState>,
}

impl RateLimiter {
    pub fn new(quota_per_second: i64, burst_size: Option<i64>) -> RateLimiter {
        let quota_per_second = quota_per_second.max(1);
        let burst_size = burst_size.unwrap_or(quota_per_second).max(1);
        RateLimiter {
            quota_per_second,
            burst_size,
            state: Mutex::new(QuotaState {
                available: burst_size,
                last_refill: Instant::now(),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QuotaState> {
        // A poisoned lock only means another thread panicked mid-acquire;
        // the quota accounting itself is still usable.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Refill at quota_per_second, capped at burst_size. Only credits whole
    /// elapsed seconds worth of units and only once at least a second has
    /// passed, matching the provider's per-second accounting granularity.
    fn refill(&self, state: &mut QuotaState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed >= 1.0 {
            let credit = (elapsed * self.quota_per_second as f64) as i64;
            state.available = self.burst_size.min(state.available + credit);
            state.last_refill = now;
        }
    }

    /// Block until `cost` units are available, then deduct them.
    ///
    /// When the bucket is short, sleeps just long enough for the deficit to
    /// refill (plus a 0.1s safety margin) and then pessimistically resets to
    /// a full burst rather than doing precise token accounting. That trades
    /// burst precision for guaranteed forward progress: a cost larger than
    /// the burst size still completes, leaving the balance negative until
    /// later refills catch up.
    pub fn acquire(&self, cost: i64) {
        let mut state = self.lock_state();
        self.refill(&mut state, Instant::now());

        if state.available < cost {
            let needed = cost - state.available;
            let wait = needed as f64 / self.quota_per_second as f64 + 0.1;
            log_debug!(
                "[Quota] short {} units, sleeping {:.2}s (cost {}, available {})",
                needed,
                wait,
                cost,
                state.available
            );
            std::thread::sleep(Duration::from_secs_f64(wait));
            state.available = self.burst_size;
            state.last_refill = Instant::now();
        }

        state.available -= cost;
    }

    /// Current available quota after a passive refill. Never blocks.
    pub fn get_current_quota(&self) -> i64 {
        let mut state = self.lock_state();
        self.refill(&mut state, Instant::now());
        state.available
    }

    /// Restore a full burst (manual reset).
    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.available = self.burst_size;
        state.last_refill = Instant::now();
    }

    pub fn quota_per_second(&self) -> i64 {
        self.quota_per_second
    }

    pub fn burst_size(&self) -> i64 {
        self.burst_size
    }
}
