//! Sentinel block parser. Pure; never fails.

use super::{TaskStatus, TestsStatus, WorkStatus};

pub const START_MARKER: &str = "---RALPH_STATUS---";
pub const END_MARKER: &str = "---END_RALPH_STATUS---";

/// Result of scanning agent output for a status block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A complete sentinel block was found
    Parsed(TaskStatus),
    /// No complete block; the common case for free-form replies
    Unparsed,
}

impl ParseOutcome {
    pub fn is_parsed(&self) -> bool {
        matches!(self, ParseOutcome::Parsed(_))
    }

    /// The status record, fully defaulted when unparsed
    pub fn into_status(self) -> TaskStatus {
        match self {
            ParseOutcome::Parsed(status) => status,
            ParseOutcome::Unparsed => TaskStatus::default(),
        }
    }
}

/// Locate the first complete sentinel block and read its `KEY: value` lines.
pub fn parse_status(output: &str) -> ParseOutcome {
    match first_block(output) {
        Some(lines) => ParseOutcome::Parsed(parse_block(&lines)),
        None => ParseOutcome::Unparsed,
    }
}

fn first_block(output: &str) -> Option<Vec<&str>> {
    let mut block: Option<Vec<&str>> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed == START_MARKER {
            // A second start before any end restarts the block
            block = Some(Vec::new());
        } else if trimmed == END_MARKER {
            if block.is_some() {
                return block;
            }
        } else if let Some(lines) = block.as_mut() {
            lines.push(trimmed);
        }
    }

    None
}

fn parse_block(lines: &[&str]) -> TaskStatus {
    let mut status = TaskStatus::default();

    for line in lines {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim().to_ascii_uppercase().as_str() {
            "STATUS" => status.status = WorkStatus::from_value(value),
            "CURRENT_TASK" => status.current_task_id = non_empty(value),
            "TASKS_COMPLETED_THIS_LOOP" => status.tasks_completed_this_loop = number(value),
            "FILES_MODIFIED" => status.files_modified = number(value),
            "TESTS_STATUS" => status.tests_status = TestsStatus::from_value(value),
            "WORK_TYPE" => status.work_type = non_empty(value),
            "EXIT_SIGNAL" => status.exit_signal = value.eq_ignore_ascii_case("true"),
            "RECOMMENDATION" => status.recommendation = non_empty(value),
            _ => {}
        }
    }

    status
}

fn number(value: &str) -> u32 {
    value.parse().unwrap_or(0)
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(value.to_string())
    }
}
