//! Exit condition aggregation.
//!
//! Three independent counters, OR-combined: the loop terminates as soon as
//! any one of them reaches its threshold.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::status::TaskStatus;

static TEST_RE: OnceLock<Regex> = OnceLock::new();
static EDIT_RE: OnceLock<Regex> = OnceLock::new();

fn test_re() -> &'static Regex {
    TEST_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(cargo test|npm (run )?test|pytest|go test|jest|vitest|bats|running \d+ tests?|\d+ tests? passed|all tests pass(ed)?)\b|\btest result:",
        )
        .expect("static test pattern")
    })
}

fn edit_re() -> &'static Regex {
    EDIT_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(created|modified|updated|edited|wrote|writing|deleted)\b[^\n]*\bfiles?\b|\b(Edit|Write|MultiEdit)\(")
            .expect("static edit pattern")
    })
}

/// Persisted counters, stored under `exit_conditions` in the state document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConditionState {
    /// Consecutive iterations that only ran tests; resets on any other iteration
    pub test_only_loops: u32,
    /// Literal completion markers seen; never reset within a session
    pub done_signals: u32,
    /// Iterations whose status block carried EXIT_SIGNAL: true
    pub completion_indicators: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitThresholds {
    pub completion_indicators: u32,
    pub test_only_loops: u32,
    pub done_signals: u32,
}

impl Default for ExitThresholds {
    fn default() -> Self {
        Self {
            completion_indicators: 2,
            test_only_loops: 3,
            done_signals: 2,
        }
    }
}

/// Which counter saturated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    CompletionIndicators,
    TestOnlyLoops,
    DoneSignals,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::CompletionIndicators => "completion_indicators",
            ExitReason::TestOnlyLoops => "test_only_loops",
            ExitReason::DoneSignals => "done_signals",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitVerdict {
    Continue,
    Terminate(ExitReason),
}

/// What one iteration's output says about termination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitEvidence {
    pub exit_signal: bool,
    pub test_only: bool,
    pub done_signal: bool,
}

impl ExitEvidence {
    pub fn from_output(output: &str, status: &TaskStatus) -> Self {
        let lowered = output.to_lowercase();
        let ran_tests = test_re().is_match(output);
        let edited = status.files_modified > 0 || edit_re().is_match(output);

        Self {
            exit_signal: status.exit_signal,
            test_only: ran_tests && !edited,
            done_signal: lowered.contains("status: complete") || lowered.contains("exit_signal: true"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExitConditionAggregator {
    thresholds: ExitThresholds,
}

impl ExitConditionAggregator {
    pub fn new(thresholds: ExitThresholds) -> Self {
        Self { thresholds }
    }

    /// Fold one iteration into the counters and evaluate them.
    pub fn observe(&self, state: &mut ExitConditionState, evidence: &ExitEvidence) -> ExitVerdict {
        if evidence.exit_signal {
            state.completion_indicators += 1;
        }

        if evidence.test_only {
            state.test_only_loops += 1;
        } else {
            state.test_only_loops = 0;
        }

        if evidence.done_signal {
            state.done_signals += 1;
        }

        self.evaluate(state)
    }

    /// Check the counters without mutating them.
    pub fn evaluate(&self, state: &ExitConditionState) -> ExitVerdict {
        if state.completion_indicators >= self.thresholds.completion_indicators {
            ExitVerdict::Terminate(ExitReason::CompletionIndicators)
        } else if state.done_signals >= self.thresholds.done_signals {
            ExitVerdict::Terminate(ExitReason::DoneSignals)
        } else if state.test_only_loops >= self.thresholds.test_only_loops {
            ExitVerdict::Terminate(ExitReason::TestOnlyLoops)
        } else {
            ExitVerdict::Continue
        }
    }
}
