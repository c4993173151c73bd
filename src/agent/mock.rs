//! Scripted agent for tests and dry runs.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Agent, AgentOutput};
use crate::error::{RalphError, Result};

/// One scripted reply
#[derive(Debug, Clone)]
pub enum MockResponse {
    Output(AgentOutput),
    /// Simulate a process that cannot be started
    SpawnFailure(String),
}

/// Replays scripted responses in order and records every prompt.
///
/// Once the script is exhausted it answers with empty successful output.
#[derive(Debug, Default)]
pub struct MockAgent {
    responses: Mutex<VecDeque<MockResponse>>,
    prompts: Mutex<Vec<String>>,
}

impl MockAgent {
    pub fn new(outputs: Vec<AgentOutput>) -> Self {
        Self::with_responses(outputs.into_iter().map(MockResponse::Output).collect())
    }

    pub fn with_responses(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn invoke(&self, prompt: &str, _timeout: Duration) -> Result<AgentOutput> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        let next = self
            .responses
            .lock()
            .map_err(|e| RalphError::AgentSpawn(e.to_string()))?
            .pop_front();

        match next {
            Some(MockResponse::Output(output)) => Ok(output),
            Some(MockResponse::SpawnFailure(reason)) => Err(RalphError::AgentSpawn(reason)),
            None => Ok(AgentOutput::completed("", 0)),
        }
    }
}
