//! Response delay resolution.

use crate::config::Response;
use crate::matcher::{matches_all, RequestView};
use std::time::Duration;

/// Compute the delay, in milliseconds, to apply before sending `response`.
///
/// With delay conditions, `staticDelayMs` only applies when every required
/// condition passes; otherwise the default applies. Without conditions, a
/// positive `staticDelayMs` always applies.
pub fn resolve(response: &Response, request: &RequestView<'_>, default_delay_ms: u64) -> u64 {
    if !response.delay_conditions.is_empty() {
        return if matches_all(&response.delay_conditions, request) {
            response.static_delay_ms
        } else {
            default_delay_ms
        };
    }

    if response.static_delay_ms > 0 {
        response.static_delay_ms
    } else {
        default_delay_ms
    }
}

/// Wait for the given delay. Only the calling task is suspended.
pub async fn apply(delay_ms: u64) {
    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}
