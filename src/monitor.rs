//! Read-only monitor polling the state document.
//!
//! The monitor never writes. A missing or unreadable document is treated as
//! "no update yet" and polling simply continues.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use colored::*;

use crate::breaker::CircuitState;
use crate::state::{RunState, StateDocument, StateStore};

/// The subset of state the monitor displays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSnapshot {
    pub iteration: u64,
    pub max_iterations: u64,
    pub run_state: RunState,
    pub last_status: Option<String>,
    pub breaker_state: CircuitState,
    pub consecutive_no_progress: u32,
    pub consecutive_same_error: u32,
    pub total_opens: u32,
    pub open_reason: Option<String>,
    pub calls_this_hour: u32,
    pub max_calls_per_hour: u32,
    pub completion_indicators: u32,
    pub test_only_loops: u32,
    pub done_signals: u32,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MonitorSnapshot {
    pub fn from_document(doc: &StateDocument) -> Self {
        Self {
            iteration: doc.loop_state.iteration,
            max_iterations: doc.loop_state.max_iterations,
            run_state: doc.loop_state.state,
            last_status: doc.loop_state.last_status.clone(),
            breaker_state: doc.circuit_breaker.state,
            consecutive_no_progress: doc.circuit_breaker.consecutive_no_progress,
            consecutive_same_error: doc.circuit_breaker.consecutive_same_error,
            total_opens: doc.circuit_breaker.total_opens,
            open_reason: doc.circuit_breaker.open_reason.clone(),
            calls_this_hour: doc.rate_limit.calls_this_hour,
            max_calls_per_hour: doc.rate_limit.max_calls_per_hour,
            completion_indicators: doc.exit_conditions.completion_indicators,
            test_only_loops: doc.exit_conditions.test_only_loops,
            done_signals: doc.exit_conditions.done_signals,
            updated_at: doc.metadata.updated_at,
        }
    }

    pub fn render(&self) -> String {
        let breaker = match self.breaker_state {
            CircuitState::Closed => self.breaker_state.to_string().green(),
            CircuitState::HalfOpen => self.breaker_state.to_string().yellow(),
            CircuitState::Open => self.breaker_state.to_string().red(),
        };

        let mut lines = vec![
            format!(
                "{} {}/{} [{}]",
                "Loop:".cyan(),
                self.iteration,
                self.max_iterations,
                self.run_state
            ),
            format!(
                "{} {} (no_progress={}, same_error={}, total_opens={})",
                "Breaker:".cyan(),
                breaker,
                self.consecutive_no_progress,
                self.consecutive_same_error,
                self.total_opens
            ),
            format!(
                "{} {}/{} this hour",
                "Calls:".cyan(),
                self.calls_this_hour,
                self.max_calls_per_hour
            ),
            format!(
                "{} completion={} test_only={} done={}",
                "Exit:".cyan(),
                self.completion_indicators,
                self.test_only_loops,
                self.done_signals
            ),
        ];
        if let Some(reason) = &self.open_reason {
            lines.push(format!("{} {}", "Open reason:".red(), reason));
        }
        if let Some(status) = &self.last_status {
            lines.push(format!("{} {}", "Last status:".cyan(), status));
        }
        lines.join("\n")
    }
}

pub struct Monitor {
    store: StateStore,
    interval: Duration,
    last: Option<MonitorSnapshot>,
}

impl Monitor {
    pub fn new(store: StateStore, interval: Duration) -> Self {
        Self {
            store,
            interval,
            last: None,
        }
    }

    /// Current snapshot, if the document is readable.
    pub fn snapshot(&self) -> Option<MonitorSnapshot> {
        self.store.try_load().map(|doc| MonitorSnapshot::from_document(&doc))
    }

    /// Snapshot only when it differs from the last one reported.
    pub fn poll(&mut self) -> Option<MonitorSnapshot> {
        let snapshot = self.snapshot()?;
        if self.last.as_ref() == Some(&snapshot) {
            return None;
        }
        self.last = Some(snapshot.clone());
        Some(snapshot)
    }

    /// Poll on a timer until `shutdown` resolves, reporting each change.
    pub async fn run<F, S>(&mut self, mut on_update: F, shutdown: S)
    where
        F: FnMut(&MonitorSnapshot),
        S: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Some(snapshot) = self.poll() {
                        on_update(&snapshot);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InitParams;
    use std::fs;
    use tempfile::TempDir;

    fn seeded_store(temp: &TempDir) -> (StateStore, StateDocument) {
        let store = StateStore::new(temp.path().join("state.json"));
        let doc = StateDocument::fresh(
            &InitParams {
                max_iterations: 20,
                max_calls_per_hour: 100,
                session_expiry_hours: 24,
                project_dir: None,
            },
            Utc::now(),
        );
        store.save(&doc).unwrap();
        (store, doc)
    }

    #[test]
    fn test_missing_document_is_no_update() {
        let temp = TempDir::new().unwrap();
        let mut monitor = Monitor::new(StateStore::new(temp.path().join("state.json")), Duration::from_millis(10));
        assert!(monitor.poll().is_none());
    }

    #[test]
    fn test_malformed_document_is_no_update() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        fs::write(&path, "{\"loop\": ").unwrap();
        let mut monitor = Monitor::new(StateStore::new(path), Duration::from_millis(10));
        assert!(monitor.poll().is_none());
    }

    #[test]
    fn test_poll_reports_only_changes() {
        let temp = TempDir::new().unwrap();
        let (store, mut doc) = seeded_store(&temp);
        let mut monitor = Monitor::new(store.clone(), Duration::from_millis(10));

        let first = monitor.poll().unwrap();
        assert_eq!(first.max_iterations, 20);
        assert!(monitor.poll().is_none());

        doc.loop_state.iteration = 1;
        store.save(&doc).unwrap();
        assert_eq!(monitor.poll().unwrap().iteration, 1);
    }

    #[test]
    fn test_monitor_does_not_write() {
        let temp = TempDir::new().unwrap();
        let (store, _) = seeded_store(&temp);
        let before = fs::read_to_string(store.path()).unwrap();
        let mut monitor = Monitor::new(store.clone(), Duration::from_millis(10));
        monitor.poll();
        assert_eq!(fs::read_to_string(store.path()).unwrap(), before);
    }

    #[test]
    fn test_render_contains_breaker_details() {
        colored::control::set_override(false);
        let temp = TempDir::new().unwrap();
        let (_, mut doc) = seeded_store(&temp);
        doc.circuit_breaker.state = CircuitState::Open;
        doc.circuit_breaker.open_reason = Some("Output declined by 80% (1000 -> 200 bytes)".to_string());

        let rendered = MonitorSnapshot::from_document(&doc).render();
        assert!(rendered.contains("Loop: 0/20 [idle]"));
        assert!(rendered.contains("Breaker: OPEN"));
        assert!(rendered.contains("Open reason: Output declined by 80%"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let temp = TempDir::new().unwrap();
        let (store, _) = seeded_store(&temp);
        let mut monitor = Monitor::new(store, Duration::from_millis(5));

        let mut updates = 0;
        monitor
            .run(|_| updates += 1, tokio::time::sleep(Duration::from_millis(50)))
            .await;
        assert_eq!(updates, 1);
    }
}
