//! Hourly call budget for agent invocations.
//!
//! The window is aligned to wall-clock hour boundaries: the counter resets to
//! zero only when `now` crosses `hour_reset_timestamp`. When the budget is
//! spent the controller suspends until the boundary instead of failing.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Persisted limiter state, stored under `rate_limit` in the state document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitState {
    pub calls_this_hour: u32,
    pub max_calls_per_hour: u32,
    /// Start of the next hour window
    pub hour_reset_timestamp: Option<DateTime<Utc>>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            calls_this_hour: 0,
            max_calls_per_hour: 100,
            hour_reset_timestamp: None,
        }
    }
}

/// Outcome of an admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A call may be made now
    Granted,
    /// Budget spent; retry after this long
    Wait(Duration),
}

/// First hour boundary strictly after `now`.
pub fn next_hour_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let next = (now.timestamp().div_euclid(3600) + 1) * 3600;
    DateTime::from_timestamp(next, 0).unwrap_or(now + TimeDelta::hours(1))
}

impl RateLimitState {
    /// Create a new limiter state with a window ending at the next hour boundary.
    pub fn new(max_calls_per_hour: u32, now: DateTime<Utc>) -> Self {
        Self {
            calls_this_hour: 0,
            max_calls_per_hour,
            hour_reset_timestamp: Some(next_hour_boundary(now)),
        }
    }

    /// Zero the counter if `now` has crossed the hour boundary.
    ///
    /// Returns true when a new window was started.
    pub fn roll_window(&mut self, now: DateTime<Utc>) -> bool {
        let crossed = match self.hour_reset_timestamp {
            Some(reset_at) => now >= reset_at,
            None => true,
        };

        if crossed {
            if self.calls_this_hour > 0 {
                tracing::info!(calls = self.calls_this_hour, "Hour boundary crossed, resetting call counter");
            }
            self.calls_this_hour = 0;
            self.hour_reset_timestamp = Some(next_hour_boundary(now));
        }
        crossed
    }

    /// Request admission for one agent invocation.
    pub fn admit(&mut self, now: DateTime<Utc>) -> Admission {
        self.roll_window(now);

        if self.calls_this_hour < self.max_calls_per_hour {
            return Admission::Granted;
        }

        let reset_at = self.hour_reset_timestamp.unwrap_or_else(|| next_hour_boundary(now));
        let wait = (reset_at - now).to_std().unwrap_or(Duration::ZERO);

        tracing::warn!(
            calls_this_hour = self.calls_this_hour,
            max_calls_per_hour = self.max_calls_per_hour,
            wait_secs = wait.as_secs(),
            "Hourly call budget spent, suspending until the next hour"
        );

        Admission::Wait(wait)
    }

    /// Count one invocation, successful or not.
    pub fn record_call(&mut self) {
        self.calls_this_hour += 1;
    }

    /// Calls still available in the current window.
    pub fn remaining(&self) -> u32 {
        self.max_calls_per_hour.saturating_sub(self.calls_this_hour)
    }
}
