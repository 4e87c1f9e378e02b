//! Per-client edit cooldown.
//!
//! DESIGN
//! ======
//! One `last_edit` timestamp per connected client, shared behind a mutex so
//! clones of the limiter (one per `AppState` clone) see the same map.
//!
//! Checking and recording are separate calls on purpose: a client is only
//! charged once an edit has actually been accepted, so spamming invalid
//! edits never extends the lockout. The limiter does not make the pair atomic
//! by itself: callers run check and record inside one critical section (the
//! edit pipeline holds the canvas lock across both).
//!
//! `forget` bounds the map to the set of live sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use uuid::Uuid;

// =============================================================================
// RATE LIMITER
// =============================================================================

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<Uuid, i64>>>,
    cooldown: Duration,
}

impl RateLimiter {
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), cooldown }
    }

    #[must_use]
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// True when the client may edit at `now` (milliseconds since epoch).
    /// Clients without a recorded edit are always eligible.
    #[must_use]
    pub fn allow(&self, client_id: Uuid, now: i64) -> bool {
        self.remaining(client_id, now).is_zero()
    }

    /// Time left until the client may edit again. Zero when eligible.
    #[must_use]
    pub fn remaining(&self, client_id: Uuid, now: i64) -> Duration {
        let Some(last) = self.lock().get(&client_id).copied() else {
            return Duration::ZERO;
        };
        // A clock that went backwards counts as no elapsed time.
        let elapsed = Duration::from_millis(u64::try_from(now.saturating_sub(last)).unwrap_or(0));
        self.cooldown.saturating_sub(elapsed)
    }

    /// Charge the cooldown. Call only after an edit was accepted.
    pub fn record(&self, client_id: Uuid, now: i64) {
        self.lock().insert(client_id, now);
    }

    /// Drop tracking for a disconnected client. Returns whether it was tracked.
    pub fn forget(&self, client_id: Uuid) -> bool {
        self.lock().remove(&client_id).is_some()
    }

    /// Number of clients currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, i64>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "rate_limit_test.rs"]
mod tests;
