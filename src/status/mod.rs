//! Structured status reported by the agent at the end of its output.
//!
//! The agent is asked to close every reply with a sentinel block:
//!
//! ```text
//! ---RALPH_STATUS---
//! STATUS: IN_PROGRESS
//! CURRENT_TASK: T-12
//! TASKS_COMPLETED_THIS_LOOP: 1
//! FILES_MODIFIED: 3
//! TESTS_STATUS: PASSING
//! WORK_TYPE: IMPLEMENTATION
//! EXIT_SIGNAL: false
//! RECOMMENDATION: continue with T-13
//! ---END_RALPH_STATUS---
//! ```

mod parser;

use serde::{Deserialize, Serialize};

pub use parser::{END_MARKER, ParseOutcome, START_MARKER, parse_status};

/// Work status declared by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStatus {
    InProgress,
    Complete,
    Blocked,
    /// No sentinel block, or an unrecognized STATUS value
    Unparsed,
}

impl WorkStatus {
    fn from_value(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
            "IN_PROGRESS" => WorkStatus::InProgress,
            "COMPLETE" | "COMPLETED" => WorkStatus::Complete,
            "BLOCKED" => WorkStatus::Blocked,
            _ => WorkStatus::Unparsed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::InProgress => "IN_PROGRESS",
            WorkStatus::Complete => "COMPLETE",
            WorkStatus::Blocked => "BLOCKED",
            WorkStatus::Unparsed => "UNPARSED",
        }
    }
}

/// Test outcome declared by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestsStatus {
    Passing,
    Failing,
    NotRun,
}

impl TestsStatus {
    fn from_value(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
            "PASSING" | "PASS" | "PASSED" => TestsStatus::Passing,
            "FAILING" | "FAIL" | "FAILED" => TestsStatus::Failing,
            _ => TestsStatus::NotRun,
        }
    }
}

/// Per-iteration status record; every field has a defined default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub status: WorkStatus,
    pub current_task_id: Option<String>,
    pub tasks_completed_this_loop: u32,
    pub files_modified: u32,
    pub tests_status: TestsStatus,
    pub work_type: Option<String>,
    pub exit_signal: bool,
    pub recommendation: Option<String>,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self {
            status: WorkStatus::Unparsed,
            current_task_id: None,
            tasks_completed_this_loop: 0,
            files_modified: 0,
            tests_status: TestsStatus::NotRun,
            work_type: None,
            exit_signal: false,
            recommendation: None,
        }
    }
}

impl TaskStatus {
    /// One-line summary stored as `loop.last_status`
    pub fn summary(&self) -> String {
        let mut summary = self.status.as_str().to_string();
        if let Some(task) = &self.current_task_id {
            summary.push_str(&format!(" task={}", task));
        }
        if self.files_modified > 0 {
            summary.push_str(&format!(" files={}", self.files_modified));
        }
        if self.exit_signal {
            summary.push_str(" exit_signal");
        }
        summary
    }
}
