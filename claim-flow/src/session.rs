//! Session validity and lockout rules.
//!
//! Instants are epoch milliseconds. The attempt counter and lockout deadline
//! live in [`crate::FlowState`]; the functions here only answer time-based
//! questions so the flow machine can apply the rules.

use chrono::Utc;

/// How long a freshly issued session stays valid
pub const SESSION_TTL_MS: i64 = 15 * 60 * 1000;

/// Failed attempts allowed before the lockout engages
pub const MAX_AUTH_ATTEMPTS: u32 = 3;

/// How long the lockout lasts once engaged
pub const LOCKOUT_MS: i64 = 24 * 60 * 60 * 1000;

/// Current instant in epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A session is valid iff token and expiry are both present and unexpired
pub fn is_session_valid(token: Option<&str>, expires_at: Option<i64>) -> bool {
    match (token, expires_at) {
        (Some(token), Some(expires_at)) if !token.is_empty() => now_ms() < expires_at,
        _ => false,
    }
}

/// Locked iff a deadline is present and still in the future
pub fn is_locked(lock_until: Option<i64>) -> bool {
    match lock_until {
        Some(until) => now_ms() < until,
        None => false,
    }
}
