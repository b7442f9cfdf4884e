use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::header::HeaderMap;

/// Wait applied when a rate-limited response carries no usable reset time.
pub const DEFAULT_PENALTY_MINUTES: i64 = 15;

/// Remembers when one endpoint may be called again.
///
/// Owned by the client instance; nothing here is process-global.
#[derive(Debug, Default)]
pub struct RateGate {
    resume_at: Mutex<Option<DateTime<Utc>>>,
}

impl RateGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(reset)` while the gate is closed. A reset time that has passed
    /// opens the gate and is forgotten.
    pub fn blocked_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut guard = self.resume_at.lock().unwrap_or_else(PoisonError::into_inner);
        match *guard {
            Some(at) if at > now => Some(at),
            Some(_) => {
                *guard = None;
                None
            }
            None => None,
        }
    }

    /// Close the gate until `at`. Never shortens an existing block.
    pub fn block_until(&self, at: DateTime<Utc>) {
        let mut guard = self.resume_at.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(guard.map_or(at, |current| current.max(at)));
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn epoch(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Resume time for a 429 response, most restrictive window first:
/// exhausted 24h user limit, exhausted 24h app limit, then the 15-minute
/// window reset. Falls back to `now + 15 min` when none is in the future.
pub fn resume_time(headers: &HeaderMap, now: DateTime<Utc>) -> DateTime<Utc> {
    let exhausted_reset = |remaining: &str, reset: &str| {
        (header_i64(headers, remaining) == Some(0))
            .then(|| header_i64(headers, reset))
            .flatten()
    };

    [
        exhausted_reset("x-user-limit-24hour-remaining", "x-user-limit-24hour-reset"),
        exhausted_reset("x-app-limit-24hour-remaining", "x-app-limit-24hour-reset"),
        header_i64(headers, "x-rate-limit-reset"),
    ]
    .into_iter()
    .flatten()
    .filter_map(epoch)
    .find(|at| *at > now)
    .unwrap_or_else(|| now + Duration::minutes(DEFAULT_PENALTY_MINUTES))
}
