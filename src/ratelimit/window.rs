//! Sliding rate limit windows.
//!
//! A window is anchored at the first accepted request of a user on an
//! endpoint, not at wall-clock boundaries. Expiry is evaluated lazily when
//! the window is read.

use chrono::{DateTime, Duration, Utc};

use super::tier::RateLimit;

/// The counting interval for one user and endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitWindow {
    window_seconds: u32,
    start_time: DateTime<Utc>,
}

impl RateLimitWindow {
    /// Create a window starting at `start_time`.
    pub fn new(start_time: DateTime<Utc>, window_seconds: u32) -> Self {
        Self {
            window_seconds,
            start_time,
        }
    }

    /// A fresh window for `limit` starting at `now`.
    pub fn starting_at(now: DateTime<Utc>, limit: &RateLimit) -> Self {
        Self::new(now, limit.window_seconds())
    }

    /// When the window started.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Window length in seconds.
    pub fn window_seconds(&self) -> u32 {
        self.window_seconds
    }

    /// When the window ends (exclusive).
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + Duration::seconds(self.window_seconds as i64)
    }

    /// True while `now` is inside the window.
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        now < self.end_time()
    }

    /// True once the window has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_current(now)
    }

    /// The window that applies at `now`: this one if still current,
    /// otherwise a new one anchored at `now`.
    pub fn advance(&self, now: DateTime<Utc>) -> Self {
        if self.is_current(now) {
            *self
        } else {
            Self::new(now, self.window_seconds)
        }
    }

    /// Instant at which the allowance resets, as seen at `now`.
    ///
    /// Stable for every call before the window elapses; afterwards it is
    /// `now + window_seconds`.
    pub fn reset_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.advance(now).end_time()
    }

    /// Whole seconds until the reset, rounded up and at least one.
    pub fn seconds_until_reset(&self, now: DateTime<Utc>) -> u64 {
        let remaining = self.reset_time(now) - now;
        let millis = remaining.num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}
