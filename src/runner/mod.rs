//! Loop runner module - the iteration controller.
//!
//! This module provides the core loop execution logic, including:
//! - LoopController for running the agent loop
//! - StopReason and IterationDecision for representing outcomes

mod loop_controller;

pub use loop_controller::{IterationDecision, LoopController, LoopControllerConfig, StopReason};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let reason = StopReason::MaxIterations;
        assert_eq!(reason.describe(), "max iterations reached");
        assert!(matches!(IterationDecision::Continue, IterationDecision::Continue));
    }
}
