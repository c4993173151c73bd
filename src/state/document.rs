//! Typed view of the persisted state document.

use std::path::PathBuf;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreakerState;
use crate::exit::ExitConditionState;
use crate::id::generate_session_id;
use crate::rate_limit::RateLimitState;

pub const STATE_VERSION: u32 = 1;

/// The whole state document. Top-level keys are fixed for monitor compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateDocument {
    pub version: u32,
    #[serde(rename = "loop")]
    pub loop_state: LoopState,
    pub tasks: TasksState,
    pub session: SessionState,
    pub circuit_breaker: CircuitBreakerState,
    pub rate_limit: RateLimitState,
    pub exit_conditions: ExitConditionState,
    pub metadata: Metadata,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            loop_state: LoopState::default(),
            tasks: TasksState::default(),
            session: SessionState::default(),
            circuit_breaker: CircuitBreakerState::default(),
            rate_limit: RateLimitState::default(),
            exit_conditions: ExitConditionState::default(),
            metadata: Metadata::default(),
        }
    }
}

/// Parameters for a freshly initialized document
#[derive(Debug, Clone)]
pub struct InitParams {
    pub max_iterations: u64,
    pub max_calls_per_hour: u32,
    pub session_expiry_hours: i64,
    pub project_dir: Option<PathBuf>,
}

impl StateDocument {
    /// Build the document written by `init`.
    pub fn fresh(params: &InitParams, now: DateTime<Utc>) -> Self {
        Self {
            version: STATE_VERSION,
            loop_state: LoopState {
                max_iterations: params.max_iterations,
                ..Default::default()
            },
            tasks: TasksState::default(),
            session: SessionState::start(params.session_expiry_hours, now),
            circuit_breaker: CircuitBreakerState::default(),
            rate_limit: RateLimitState::new(params.max_calls_per_hour, now),
            exit_conditions: ExitConditionState::default(),
            metadata: Metadata {
                created_at: Some(now),
                updated_at: Some(now),
                project_dir: params.project_dir.clone(),
            },
        }
    }

    /// Replace an expired session. Loop progress and exit counters belong to
    /// the session and restart; breaker and rate-limit state carry over.
    pub fn renew_session(&mut self, session_expiry_hours: i64, now: DateTime<Utc>) {
        self.session = SessionState::start(session_expiry_hours, now);
        self.loop_state.iteration = 0;
        self.loop_state.state = RunState::Idle;
        self.exit_conditions = ExitConditionState::default();
        self.tasks = TasksState::default();
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.metadata.updated_at = Some(now);
    }
}

/// Run state of the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Complete,
    Error,
    CircuitOpen,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Complete => "complete",
            RunState::Error => "error",
            RunState::CircuitOpen => "circuit_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopState {
    /// Monotonic within a session
    pub iteration: u64,
    pub max_iterations: u64,
    pub state: RunState,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            iteration: 0,
            max_iterations: 100,
            state: RunState::Idle,
            last_run: None,
            last_status: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksState {
    pub current_task_id: Option<String>,
    pub tasks_completed: u64,
    pub last_work_type: Option<String>,
    pub last_recommendation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub session_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn start(expiry_hours: i64, now: DateTime<Utc>) -> Self {
        Self {
            session_id: generate_session_id(),
            started_at: Some(now),
            last_activity: Some(now),
            expires_at: Some(now + TimeDelta::hours(expiry_hours)),
        }
    }

    /// A session without an id or expiry was never started and counts as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.session_id.is_empty() {
            return true;
        }
        self.expires_at.map(|at| now >= at).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub project_dir: Option<PathBuf>,
}
