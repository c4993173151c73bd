//! The agent collaborator: one prompt in, captured output and exit code out.
//!
//! The agent is a black box. The loop controller only needs [`Agent`]; the
//! production implementation spawns a process per call ([`CommandAgent`]).

mod command;
mod mock;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use command::CommandAgent;
pub use mock::{MockAgent, MockResponse};

/// Everything observed from one agent invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutput {
    /// Captured stdout followed by stderr
    pub output: String,
    /// None when the process was killed or its status was unavailable
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Output was not valid UTF-8 and was decoded lossily
    pub lossy: bool,
}

impl AgentOutput {
    /// A normal completion with the given output and exit code
    pub fn completed(output: impl Into<String>, exit_code: i32) -> Self {
        Self {
            output: output.into(),
            exit_code: Some(exit_code),
            timed_out: false,
            lossy: false,
        }
    }

    /// The invocation ran past its deadline and was killed
    pub fn timed_out(partial_output: impl Into<String>) -> Self {
        Self {
            output: partial_output.into(),
            exit_code: None,
            timed_out: true,
            lossy: false,
        }
    }

    /// Whether this invocation counts as an erroring iteration
    pub fn is_failure(&self) -> bool {
        self.timed_out || self.lossy || self.exit_code != Some(0)
    }
}

/// A synchronous, non-concurrent task executor.
///
/// `invoke` returns `Err` only when the agent could not be started at all;
/// every other failure is reported through [`AgentOutput`].
#[async_trait]
pub trait Agent: Send + Sync {
    async fn invoke(&self, prompt: &str, timeout: Duration) -> Result<AgentOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert!(!AgentOutput::completed("ok", 0).is_failure());
        assert!(AgentOutput::completed("boom", 2).is_failure());
        assert!(AgentOutput::timed_out("").is_failure());

        let mut lossy = AgentOutput::completed("x\u{FFFD}", 0);
        lossy.lossy = true;
        assert!(lossy.is_failure());
    }
}
