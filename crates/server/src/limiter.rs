//! Per-user connection admission control (spec §4.2).
//!
//! Purely a counter — it has no notion of specific connections. The
//! Lifecycle Manager is the sole caller and is responsible for pairing every
//! successful [`ConnectionLimiter::allow`] with exactly one
//! [`ConnectionLimiter::release`]; leaking that pairing is called out in
//! spec §5 as the dominant production risk for this component.

use std::collections::HashMap;
use std::sync::Mutex;

/// Counting admission limiter keyed by `user_id`, capped at a constant
/// per-user maximum (10 in the reference, configurable at construction).
pub struct ConnectionLimiter {
    counts: Mutex<HashMap<String, usize>>,
    max_per_user: usize,
}

impl ConnectionLimiter {
    pub fn new(max_per_user: usize) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            max_per_user,
        }
    }

    /// Acquire a slot for `user_id`. Returns `false` (no slot acquired) if
    /// the user is already at the cap.
    pub fn allow(&self, user_id: &str) -> bool {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let entry = counts.entry(user_id.to_string()).or_insert(0);
        if *entry >= self.max_per_user {
            return false;
        }
        *entry += 1;
        true
    }

    /// Release one previously-acquired slot for `user_id`. A release with no
    /// matching `allow` is a no-op (defensive — it must never underflow
    /// below zero or leave a negative-looking count).
    pub fn release(&self, user_id: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = counts.get_mut(user_id) {
            if *entry > 0 {
                *entry -= 1;
            }
            if *entry == 0 {
                counts.remove(user_id);
            }
        }
    }

    /// Current in-use slot count for `user_id`, for metrics/tests.
    pub fn current(&self, user_id: &str) -> usize {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.get(user_id).copied().unwrap_or(0)
    }
}
