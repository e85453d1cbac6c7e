//! Rate-limited login gate.
//!
//! Tracks consecutive failed logins per source address; after the
//! threshold the address is blocked for a cooldown window. Blocked
//! attempts fail closed with the remaining seconds; a successful login
//! clears the counter. State is in-process (one counter per instance),
//! which matches the single-process deployment model.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use billflow_core::DomainError;

#[derive(Debug, Default, Clone, Copy)]
struct AttemptState {
    consecutive_failures: u32,
    blocked_until: Option<DateTime<Utc>>,
}

/// Per-source-address failed-login throttle.
#[derive(Debug)]
pub struct LoginThrottle {
    max_failures: u32,
    cooldown: Duration,
    state: Mutex<HashMap<String, AttemptState>>,
}

impl LoginThrottle {
    pub fn new(max_failures: u32, cooldown: Duration) -> Self {
        Self {
            max_failures,
            cooldown,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether `addr` may attempt a login at `now`.
    ///
    /// Returns `RateLimited` with the remaining cooldown when blocked.
    pub fn check(&self, addr: &str, now: DateTime<Utc>) -> Result<(), DomainError> {
        let state = self.state.lock().unwrap();
        if let Some(entry) = state.get(addr)
            && let Some(until) = entry.blocked_until
            && now < until
        {
            let remaining = (until - now).num_seconds().max(1);
            return Err(DomainError::rate_limited(remaining));
        }
        Ok(())
    }

    /// Record a failed attempt from `addr`.
    pub fn record_failure(&self, addr: &str, now: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(addr.to_string()).or_default();

        // An expired block starts a fresh counting window.
        if let Some(until) = entry.blocked_until
            && now >= until
        {
            entry.blocked_until = None;
            entry.consecutive_failures = 0;
        }

        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.max_failures {
            entry.blocked_until = Some(now + self.cooldown);
            entry.consecutive_failures = 0;
        }
    }

    /// Clear the counter for `addr` after a successful login.
    pub fn record_success(&self, addr: &str) {
        self.state.lock().unwrap().remove(addr);
    }
}
