//! # Security Lockout Policy
//!
//! One threshold rule shared by every attempt counter in the system:
//!
//! | Counter | Storage | Effect at threshold |
//! |---------|---------|---------------------|
//! | Payment confirmation attempts | `payments.attempts` | `is_locked`, status `failed` |
//! | OTP verification attempts | `otps.attempts` | code permanently unusable |
//! | Failed logins | `users.failed_login_attempts` | `is_locked` |
//!
//! The policy is pure; each caller owns its counter and persists the
//! outcome in the same transaction that bumped it. Locks never expire on
//! their own; only an explicit admin action clears them.

/// Default number of failures that triggers a lock.
pub const DEFAULT_LOCKOUT_THRESHOLD: i32 = 5;

/// Outcome of evaluating a counter against the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutDecision {
    pub locked: bool,
    /// Attempts left before the lock engages, never negative.
    pub remaining: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    threshold: i32,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_LOCKOUT_THRESHOLD)
    }
}

impl LockoutPolicy {
    pub fn new(threshold: i32) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    /// `locked ⇔ attempts ≥ threshold`.
    pub fn evaluate(&self, attempts: i32) -> LockoutDecision {
        LockoutDecision {
            locked: attempts >= self.threshold,
            remaining: (self.threshold - attempts).max(0),
        }
    }

    /// Bump a counter by one failure and evaluate the new value.
    pub fn record_failure(&self, attempts: &mut i32) -> LockoutDecision {
        *attempts = attempts.saturating_add(1);
        self.evaluate(*attempts)
    }
}
