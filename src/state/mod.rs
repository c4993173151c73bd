//! Persistent loop state.
//!
//! One JSON document holds loop, session, breaker, rate-limit and
//! exit-condition state. It is owned by the loop controller; the operator
//! CLI and the monitor go through [`StateStore`] only.

mod document;
mod store;

use std::path::{Path, PathBuf};

pub use document::{
    InitParams, LoopState, Metadata, RunState, STATE_VERSION, SessionState, StateDocument, TasksState,
};
pub use store::StateStore;

/// File locations under the state directory
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn alert_file(&self) -> PathBuf {
        self.root.join("circuit_breaker_alert.txt")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(self.state_file())
    }
}
