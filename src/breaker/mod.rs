//! Circuit breaker guarding the loop against stagnation, repeated errors
//! and output collapse.
//!
//! The transition logic is a pure function over [`CircuitBreakerState`]; the
//! [`CircuitBreaker`] wrapper applies the resulting effects (alert artifact)
//! and logs the transition.

mod alert;
mod stuck;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use alert::{AlertArtifact, AlertNotice};
pub use stuck::{detect_stuck_loop, error_lines};

/// Reason recorded when a half-open probation iteration fails.
pub const HALF_OPEN_FAILURE_REASON: &str = "recovery attempt failed in half-open state";

/// Breaker state machine positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Probation after a manual reset
    HalfOpen,
    /// Execution blocked until reset
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::Open => "OPEN",
        };
        f.write_str(s)
    }
}

/// Persisted breaker state, stored under `circuit_breaker` in the state document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_no_progress: u32,
    pub consecutive_same_error: u32,
    pub last_progress_loop: u64,
    /// Lifetime count of transitions into Open; never cleared by reset
    pub total_opens: u32,
    pub open_reason: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub previous_output_length: u64,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_no_progress: 0,
            consecutive_same_error: 0,
            last_progress_loop: 0,
            total_opens: 0,
            open_reason: None,
            opened_at: None,
            previous_output_length: 0,
        }
    }
}

impl CircuitBreakerState {
    /// Whether the loop may invoke the agent
    pub fn can_execute(&self) -> bool {
        self.state != CircuitState::Open
    }
}

/// Trip thresholds for the three independent open conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerThresholds {
    pub no_progress: u32,
    pub same_error: u32,
    /// Open when the output shrinks by strictly more than this percentage
    pub output_decline_pct: i64,
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            no_progress: 3,
            same_error: 5,
            output_decline_pct: 70,
        }
    }
}

/// Observations from one iteration fed into the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationSignal {
    pub loop_number: u64,
    pub files_changed: u64,
    pub has_errors: bool,
    pub output_length: u64,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerEffect {
    /// Write the alert artifact
    Opened(AlertNotice),
    /// Half-open probation succeeded
    Recovered,
    /// Delete the alert artifact
    ClearAlert,
}

/// Compute the next breaker state for one iteration.
///
/// While Open the inputs are ignored; only [`reset`] leaves Open.
pub fn transition(
    state: &CircuitBreakerState,
    signal: &IterationSignal,
    thresholds: &BreakerThresholds,
    now: DateTime<Utc>,
) -> (CircuitBreakerState, Vec<BreakerEffect>) {
    match state.state {
        CircuitState::Open => (state.clone(), Vec::new()),
        CircuitState::HalfOpen => half_open_transition(state, signal, now),
        CircuitState::Closed => closed_transition(state, signal, thresholds, now),
    }
}

fn closed_transition(
    state: &CircuitBreakerState,
    signal: &IterationSignal,
    thresholds: &BreakerThresholds,
    now: DateTime<Utc>,
) -> (CircuitBreakerState, Vec<BreakerEffect>) {
    let mut next = state.clone();

    if signal.files_changed == 0 {
        next.consecutive_no_progress += 1;
    } else {
        next.consecutive_no_progress = 0;
        next.last_progress_loop = signal.loop_number;
    }

    if signal.has_errors {
        next.consecutive_same_error += 1;
    } else {
        next.consecutive_same_error = 0;
    }

    let previous = next.previous_output_length;
    let decline_pct = if previous > 0 {
        let retained = (signal.output_length as u128 * 100 / previous as u128) as i64;
        Some(100 - retained)
    } else {
        None
    };
    next.previous_output_length = signal.output_length;

    // Fixed precedence: no-progress, then same-error, then decline
    let reason = if next.consecutive_no_progress >= thresholds.no_progress {
        Some(format!(
            "No progress detected in {} consecutive loops",
            next.consecutive_no_progress
        ))
    } else if next.consecutive_same_error >= thresholds.same_error {
        Some(format!(
            "Same error repeated in {} consecutive loops",
            next.consecutive_same_error
        ))
    } else {
        decline_pct.filter(|pct| *pct > thresholds.output_decline_pct).map(|pct| {
            format!(
                "Output declined by {}% ({} -> {} bytes)",
                pct, previous, signal.output_length
            )
        })
    };

    match reason {
        Some(reason) => open(next, reason, now),
        None => (next, Vec::new()),
    }
}

fn half_open_transition(
    state: &CircuitBreakerState,
    signal: &IterationSignal,
    now: DateTime<Utc>,
) -> (CircuitBreakerState, Vec<BreakerEffect>) {
    let mut next = state.clone();
    next.previous_output_length = signal.output_length;

    if signal.files_changed > 0 && !signal.has_errors {
        next.state = CircuitState::Closed;
        next.consecutive_no_progress = 0;
        next.consecutive_same_error = 0;
        next.last_progress_loop = signal.loop_number;
        next.open_reason = None;
        next.opened_at = None;
        (next, vec![BreakerEffect::Recovered])
    } else {
        open(next, HALF_OPEN_FAILURE_REASON.to_string(), now)
    }
}

fn open(
    mut next: CircuitBreakerState,
    reason: String,
    now: DateTime<Utc>,
) -> (CircuitBreakerState, Vec<BreakerEffect>) {
    next.state = CircuitState::Open;
    next.total_opens += 1;
    next.opened_at = Some(now);
    next.open_reason = Some(reason.clone());

    let notice = AlertNotice {
        timestamp: now,
        reason,
        total_opens: next.total_opens,
    };
    (next, vec![BreakerEffect::Opened(notice)])
}

/// Operator reset: Open moves to HalfOpen, both consecutive counters clear.
///
/// `total_opens` is a lifetime counter and is left untouched. A reset from
/// Closed or HalfOpen only clears the counters.
pub fn reset(state: &CircuitBreakerState) -> (CircuitBreakerState, Vec<BreakerEffect>) {
    let mut next = state.clone();
    if next.state == CircuitState::Open {
        next.state = CircuitState::HalfOpen;
    }
    next.consecutive_no_progress = 0;
    next.consecutive_same_error = 0;
    (next, vec![BreakerEffect::ClearAlert])
}

/// Applies breaker transitions to persisted state and carries out their effects.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    thresholds: BreakerThresholds,
    alert: AlertArtifact,
}

impl CircuitBreaker {
    pub fn new(thresholds: BreakerThresholds, alert: AlertArtifact) -> Self {
        Self { thresholds, alert }
    }

    pub fn alert(&self) -> &AlertArtifact {
        &self.alert
    }

    /// Feed one iteration into the breaker, updating `state` in place.
    pub fn record(
        &self,
        state: &mut CircuitBreakerState,
        signal: &IterationSignal,
        now: DateTime<Utc>,
    ) -> Result<Vec<BreakerEffect>> {
        let previous = state.state;
        let (next, effects) = transition(state, signal, &self.thresholds, now);
        *state = next;

        if previous != state.state {
            tracing::info!(
                from = %previous,
                to = %state.state,
                loop_number = signal.loop_number,
                total_opens = state.total_opens,
                "Circuit breaker transition"
            );
        }

        self.apply(&effects)?;
        Ok(effects)
    }

    /// Operator reset, updating `state` in place and removing the alert.
    pub fn reset(&self, state: &mut CircuitBreakerState) -> Result<()> {
        let previous = state.state;
        let (next, effects) = reset(state);
        *state = next;
        log::info!("Circuit breaker reset: {} -> {}", previous, state.state);
        self.apply(&effects)
    }

    fn apply(&self, effects: &[BreakerEffect]) -> Result<()> {
        for effect in effects {
            match effect {
                BreakerEffect::Opened(notice) => {
                    log::warn!("Circuit breaker opened: {}", notice.reason);
                    self.alert.write(notice)?;
                }
                BreakerEffect::Recovered => {
                    log::info!("Circuit breaker recovered from half-open state");
                }
                BreakerEffect::ClearAlert => self.alert.remove()?,
            }
        }
        Ok(())
    }
}
