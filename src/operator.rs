//! Operator actions behind the CLI: init, status, reset, check and record.
//!
//! Each action is one read-modify-write through [`StateStore`], so the CLI
//! never re-derives breaker logic on its own.

use chrono::Utc;

use crate::breaker::{AlertArtifact, BreakerThresholds, CircuitBreaker, CircuitBreakerState, IterationSignal};
use crate::error::Result;
use crate::state::{InitParams, StateDocument, StateLayout};

/// Result of `init`
#[derive(Debug, Clone, PartialEq)]
pub enum InitOutcome {
    Created(StateDocument),
    /// A document already existed and `force` was not set
    AlreadyInitialized(StateDocument),
}

/// Operator entry points over one state directory
#[derive(Debug, Clone)]
pub struct Operator {
    layout: StateLayout,
    breaker: CircuitBreaker,
}

impl Operator {
    pub fn new(layout: StateLayout, thresholds: BreakerThresholds) -> Self {
        let breaker = CircuitBreaker::new(thresholds, AlertArtifact::new(layout.alert_file()));
        Self { layout, breaker }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    /// Create the state document; `force` replaces an existing one.
    pub fn init(&self, params: &InitParams, force: bool) -> Result<InitOutcome> {
        let store = self.layout.store();
        if store.exists() && !force {
            return Ok(InitOutcome::AlreadyInitialized(store.load()?));
        }

        let doc = StateDocument::fresh(params, Utc::now());
        store.save(&doc)?;
        self.breaker.alert().remove()?;
        log::info!("Initialized state at {}", store.path().display());
        Ok(InitOutcome::Created(doc))
    }

    pub fn status(&self) -> Result<CircuitBreakerState> {
        Ok(self.layout.store().load()?.circuit_breaker)
    }

    /// Open goes to HalfOpen; counters clear; the alert is deleted.
    pub fn reset(&self) -> Result<CircuitBreakerState> {
        let store = self.layout.store();
        let mut doc = store.load()?;
        self.breaker.reset(&mut doc.circuit_breaker)?;
        doc.touch(Utc::now());
        store.save(&doc)?;
        Ok(doc.circuit_breaker)
    }

    /// Whether the loop may invoke the agent right now
    pub fn check(&self) -> Result<bool> {
        Ok(self.status()?.can_execute())
    }

    /// Feed one externally observed iteration into the breaker.
    pub fn record(&self, signal: &IterationSignal) -> Result<CircuitBreakerState> {
        let store = self.layout.store();
        let mut doc = store.load()?;
        let now = Utc::now();
        self.breaker.record(&mut doc.circuit_breaker, signal, now)?;
        doc.touch(now);
        store.save(&doc)?;
        Ok(doc.circuit_breaker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use crate::error::RalphError;
    use tempfile::TempDir;

    fn params() -> InitParams {
        InitParams {
            max_iterations: 50,
            max_calls_per_hour: 100,
            session_expiry_hours: 24,
            project_dir: None,
        }
    }

    fn operator(temp: &TempDir) -> Operator {
        Operator::new(StateLayout::new(temp.path()), BreakerThresholds::default())
    }

    fn idle(loop_number: u64) -> IterationSignal {
        IterationSignal {
            loop_number,
            files_changed: 0,
            has_errors: false,
            output_length: 100,
        }
    }

    #[test]
    fn test_init_is_once_unless_forced() {
        let temp = TempDir::new().unwrap();
        let op = operator(&temp);

        let InitOutcome::Created(first) = op.init(&params(), false).unwrap() else {
            panic!("expected a new document");
        };
        let InitOutcome::AlreadyInitialized(again) = op.init(&params(), false).unwrap() else {
            panic!("expected the existing document");
        };
        assert_eq!(first.session.session_id, again.session.session_id);

        let InitOutcome::Created(forced) = op.init(&params(), true).unwrap() else {
            panic!("expected a replaced document");
        };
        assert_ne!(first.session.session_id, forced.session.session_id);
    }

    #[test]
    fn test_commands_require_init() {
        let temp = TempDir::new().unwrap();
        let op = operator(&temp);
        assert!(matches!(op.status(), Err(RalphError::StateMissing(_))));
        assert!(op.check().is_err());
    }

    #[test]
    fn test_record_open_check_reset_cycle() {
        let temp = TempDir::new().unwrap();
        let op = operator(&temp);
        op.init(&params(), false).unwrap();
        assert!(op.check().unwrap());

        for n in 1..=3 {
            op.record(&idle(n)).unwrap();
        }
        let state = op.status().unwrap();
        assert_eq!(state.state, CircuitState::Open);
        assert!(!op.check().unwrap());
        assert!(op.layout().alert_file().exists());

        let state = op.reset().unwrap();
        assert_eq!(state.state, CircuitState::HalfOpen);
        assert_eq!(state.total_opens, 1);
        assert_eq!(state.consecutive_no_progress, 0);
        assert!(op.check().unwrap());
        assert!(!op.layout().alert_file().exists());

        let recovered = op
            .record(&IterationSignal {
                loop_number: 4,
                files_changed: 5,
                has_errors: false,
                output_length: 100,
            })
            .unwrap();
        assert_eq!(recovered.state, CircuitState::Closed);
    }
}
