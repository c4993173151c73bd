//! Loop controller implementation - drives one agent invocation per iteration.
//!
//! Each iteration:
//! 1. Refuses to run while the circuit breaker is open
//! 2. Waits for rate-limit admission (suspends, never fails)
//! 3. Builds a fresh context from state and recent notes
//! 4. Invokes the agent with a wall-clock timeout
//! 5. Parses the status block and feeds breaker and exit aggregator
//! 6. Commits state atomically and decides whether to continue

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::agent::{Agent, AgentOutput};
use crate::breaker::{
    AlertArtifact, BreakerThresholds, CircuitBreaker, IterationSignal, detect_stuck_loop, error_lines,
};
use crate::config::Config;
use crate::error::{RalphError, Result};
use crate::exit::{ExitConditionAggregator, ExitEvidence, ExitReason, ExitThresholds, ExitVerdict};
use crate::history::{HistoryStore, IterationRecord};
use crate::rate_limit::Admission;
use crate::state::{InitParams, RunState, StateDocument, StateLayout, StateStore};
use crate::status::{TaskStatus, parse_status};

/// Why the loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Iteration counter reached `max_iterations`
    MaxIterations,
    /// Breaker is open; carries the recorded reason
    CircuitOpen(String),
    /// An exit counter saturated
    ExitCondition(ExitReason),
    /// The agent could not be started at all
    AgentFailedToStart(String),
}

impl StopReason {
    fn run_state(&self) -> RunState {
        match self {
            StopReason::MaxIterations => RunState::Idle,
            StopReason::CircuitOpen(_) => RunState::CircuitOpen,
            StopReason::ExitCondition(_) => RunState::Complete,
            StopReason::AgentFailedToStart(_) => RunState::Error,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            StopReason::MaxIterations => "max iterations reached".to_string(),
            StopReason::CircuitOpen(reason) => format!("circuit breaker open: {}", reason),
            StopReason::ExitCondition(reason) => format!("exit condition met: {}", reason),
            StopReason::AgentFailedToStart(reason) => format!("agent failed to start: {}", reason),
        }
    }
}

/// Decision taken after an iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationDecision {
    Continue,
    Stop(StopReason),
}

/// Settings for the controller, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct LoopControllerConfig {
    pub max_iterations: u64,
    pub max_calls_per_hour: u32,
    pub session_expiry_hours: i64,
    pub agent_timeout: Duration,
    pub stuck_window: usize,
    pub notes_max_chars: usize,
    pub breaker: BreakerThresholds,
    pub exit: ExitThresholds,
}

impl Default for LoopControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_calls_per_hour: 100,
            session_expiry_hours: 24,
            agent_timeout: Duration::from_secs(15 * 60),
            stuck_window: 5,
            notes_max_chars: 4000,
            breaker: BreakerThresholds::default(),
            exit: ExitThresholds::default(),
        }
    }
}

impl LoopControllerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_iterations: config.loop_.max_iterations,
            max_calls_per_hour: config.rate_limit.max_calls_per_hour,
            session_expiry_hours: config.loop_.session_expiry_hours,
            agent_timeout: config.agent.timeout(),
            stuck_window: config.breaker.stuck_window,
            notes_max_chars: config.agent.notes_max_chars,
            breaker: config.breaker.thresholds(),
            exit: config.exit.thresholds(),
        }
    }
}

/// Composes breaker, exit aggregator, rate limiter and state store around a
/// strictly sequential agent loop.
pub struct LoopController<A>
where
    A: Agent,
{
    agent: Arc<A>,
    store: StateStore,
    history: HistoryStore,
    breaker: CircuitBreaker,
    exit: ExitConditionAggregator,
    /// Base prompt sent at the top of every iteration
    prompt: String,
    notes_file: Option<PathBuf>,
    project_dir: Option<PathBuf>,
    config: LoopControllerConfig,
}

impl<A> LoopController<A>
where
    A: Agent,
{
    pub fn new(agent: Arc<A>, layout: &StateLayout, prompt: impl Into<String>, config: LoopControllerConfig) -> Self {
        Self {
            agent,
            store: layout.store(),
            history: HistoryStore::new(layout.history_dir()),
            breaker: CircuitBreaker::new(config.breaker, AlertArtifact::new(layout.alert_file())),
            exit: ExitConditionAggregator::new(config.exit),
            prompt: prompt.into(),
            notes_file: None,
            project_dir: std::env::current_dir().ok(),
            config,
        }
    }

    /// Append the tail of this file to every prompt
    pub fn with_notes(mut self, notes_file: impl Into<PathBuf>) -> Self {
        self.notes_file = Some(notes_file.into());
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Root of the per-session history directories
    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Load committed state (or initialize it), renew an expired session and
    /// apply the configured limits.
    ///
    /// A corrupt document is fatal: nothing is attempted.
    pub fn prepare(&self) -> Result<StateDocument> {
        if self.config.max_calls_per_hour == 0 {
            return Err(RalphError::Config("rate_limit.max_calls_per_hour must be at least 1".to_string()));
        }

        let now = Utc::now();
        let mut doc = if self.store.exists() {
            self.store.load()?
        } else {
            log::info!("No state at {}, initializing", self.store.path().display());
            StateDocument::fresh(
                &InitParams {
                    max_iterations: self.config.max_iterations,
                    max_calls_per_hour: self.config.max_calls_per_hour,
                    session_expiry_hours: self.config.session_expiry_hours,
                    project_dir: self.project_dir.clone(),
                },
                now,
            )
        };

        if doc.session.is_expired(now) {
            log::info!("Session '{}' expired, starting a new one", doc.session.session_id);
            doc.renew_session(self.config.session_expiry_hours, now);
        }

        doc.loop_state.max_iterations = self.config.max_iterations;
        doc.rate_limit.max_calls_per_hour = self.config.max_calls_per_hour;
        doc.touch(now);
        self.store.save(&doc)?;
        Ok(doc)
    }

    /// Run iterations until a stop condition is reached.
    pub async fn run(&self) -> Result<StopReason> {
        let mut doc = self.prepare()?;
        log::info!(
            "Starting loop at iteration {} of {} (session {})",
            doc.loop_state.iteration,
            doc.loop_state.max_iterations,
            doc.session.session_id
        );

        loop {
            if let IterationDecision::Stop(reason) = self.run_iteration(&mut doc).await? {
                return Ok(reason);
            }
        }
    }

    /// Execute exactly one iteration against `doc`, committing the result.
    pub async fn run_iteration(&self, doc: &mut StateDocument) -> Result<IterationDecision> {
        if doc.loop_state.iteration >= doc.loop_state.max_iterations {
            return self.stop(doc, StopReason::MaxIterations);
        }
        if let Some(decision) = self.gate_open_breaker(doc)? {
            return Ok(decision);
        }

        self.await_admission(doc).await?;

        if let Some(decision) = self.gate_open_breaker(doc)? {
            return Ok(decision);
        }

        let history = self.history.session(&doc.session.session_id);
        let loop_number = doc.loop_state.iteration + 1;
        let prompt = self.build_context(doc, loop_number);
        history.write_prompt(loop_number, &prompt)?;

        // Counted before invoking so an interrupted call is still charged to this window
        let started = Utc::now();
        doc.rate_limit.record_call();
        doc.loop_state.state = RunState::Running;
        doc.touch(started);
        self.store.save(doc)?;

        log::info!("Loop {}: invoking agent", loop_number);
        let output = match self.agent.invoke(&prompt, self.config.agent_timeout).await {
            Ok(output) => output,
            Err(e) => {
                log::error!("Loop {}: {}", loop_number, e);
                return self.stop(doc, StopReason::AgentFailedToStart(e.to_string()));
            }
        };

        self.commit_iteration(doc, &history, loop_number, started, output)
    }

    fn gate_open_breaker(&self, doc: &mut StateDocument) -> Result<Option<IterationDecision>> {
        if doc.circuit_breaker.can_execute() {
            return Ok(None);
        }
        let reason = doc.circuit_breaker.open_reason.clone().unwrap_or_default();
        self.stop(doc, StopReason::CircuitOpen(reason)).map(Some)
    }

    fn commit_iteration(
        &self,
        doc: &mut StateDocument,
        history: &HistoryStore,
        loop_number: u64,
        started: chrono::DateTime<Utc>,
        output: AgentOutput,
    ) -> Result<IterationDecision> {
        let status = parse_status(&output.output).into_status();
        let has_errors = output.is_failure() || !error_lines(&output.output).is_empty();
        let signal = IterationSignal {
            loop_number,
            files_changed: u64::from(status.files_modified),
            has_errors,
            output_length: output.output.len() as u64,
        };
        log::info!(
            "Loop {}: status={} files_changed={} has_errors={} output_length={}",
            loop_number,
            status.status.as_str(),
            signal.files_changed,
            signal.has_errors,
            signal.output_length
        );

        let now = Utc::now();
        self.breaker.record(&mut doc.circuit_breaker, &signal, now)?;
        let evidence = ExitEvidence::from_output(&output.output, &status);
        let verdict = self.exit.observe(&mut doc.exit_conditions, &evidence);

        history.append(&IterationRecord {
            loop_number,
            files_changed: signal.files_changed,
            has_errors,
            output_length: signal.output_length,
            exit_code: output.exit_code,
            timed_out: output.timed_out,
            status: status.status,
            recorded_at: now,
            raw_output: output.output,
        })?;

        let stuck = self.check_stuck(history);
        let mut last_status = status.summary();
        if stuck {
            log::warn!(
                "Loop {}: the same errors repeated over the last {} iterations",
                loop_number,
                self.config.stuck_window
            );
            last_status.push_str(" (stuck: repeated errors)");
        }

        doc.loop_state.iteration = loop_number;
        doc.loop_state.last_run = Some(started);
        doc.loop_state.last_status = Some(last_status);
        self.update_tasks(doc, &status);
        doc.session.last_activity = Some(now);
        doc.touch(now);

        if !doc.circuit_breaker.can_execute() {
            let reason = doc.circuit_breaker.open_reason.clone().unwrap_or_default();
            return self.stop(doc, StopReason::CircuitOpen(reason));
        }
        if let ExitVerdict::Terminate(reason) = verdict {
            return self.stop(doc, StopReason::ExitCondition(reason));
        }
        if doc.loop_state.iteration >= doc.loop_state.max_iterations {
            return self.stop(doc, StopReason::MaxIterations);
        }

        self.store.save(doc)?;
        Ok(IterationDecision::Continue)
    }

    /// Suspend until the hourly budget admits another call.
    async fn await_admission(&self, doc: &mut StateDocument) -> Result<()> {
        loop {
            match doc.rate_limit.admit(Utc::now()) {
                Admission::Granted => return Ok(()),
                Admission::Wait(wait) => {
                    log::info!("Rate limit reached, waiting {}s for the next hour", wait.as_secs());
                    doc.loop_state.last_status = Some(format!("rate limited: waiting {}s", wait.as_secs()));
                    doc.touch(Utc::now());
                    self.store.save(doc)?;
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Terminal checkpoint: record the stop in state and commit.
    fn stop(&self, doc: &mut StateDocument, reason: StopReason) -> Result<IterationDecision> {
        log::info!("Stopping loop at iteration {}: {}", doc.loop_state.iteration, reason.describe());
        doc.loop_state.state = reason.run_state();
        if matches!(reason, StopReason::AgentFailedToStart(_) | StopReason::CircuitOpen(_)) {
            doc.loop_state.last_status = Some(reason.describe());
        }
        doc.touch(Utc::now());
        self.store.save(doc)?;
        Ok(IterationDecision::Stop(reason))
    }

    fn check_stuck(&self, history: &HistoryStore) -> bool {
        match history.recent_outputs(self.config.stuck_window) {
            Ok(outputs) => detect_stuck_loop(&outputs, self.config.stuck_window),
            Err(e) => {
                log::warn!("Stuck-loop check skipped: {}", e);
                false
            }
        }
    }

    fn update_tasks(&self, doc: &mut StateDocument, status: &TaskStatus) {
        let tasks = &mut doc.tasks;
        if status.current_task_id.is_some() {
            tasks.current_task_id = status.current_task_id.clone();
        }
        tasks.tasks_completed += u64::from(status.tasks_completed_this_loop);
        if status.work_type.is_some() {
            tasks.last_work_type = status.work_type.clone();
        }
        if status.recommendation.is_some() {
            tasks.last_recommendation = status.recommendation.clone();
        }
    }

    /// Prompt for this iteration: base prompt, loop context and recent notes.
    fn build_context(&self, doc: &StateDocument, loop_number: u64) -> String {
        let mut prompt = self.prompt.trim_end().to_string();

        prompt.push_str("\n\n## Loop Context\n");
        prompt.push_str(&format!(
            "- Loop: {} of {}\n",
            loop_number, doc.loop_state.max_iterations
        ));
        prompt.push_str(&format!("- Circuit breaker: {}\n", doc.circuit_breaker.state));
        prompt.push_str(&format!("- Calls remaining this hour: {}\n", doc.rate_limit.remaining()));
        if let Some(task) = &doc.tasks.current_task_id {
            prompt.push_str(&format!("- Current task: {}\n", task));
        }
        if let Some(status) = &doc.loop_state.last_status {
            prompt.push_str(&format!("- Last status: {}\n", status));
        }
        if let Some(recommendation) = &doc.tasks.last_recommendation {
            prompt.push_str(&format!("- Last recommendation: {}\n", recommendation));
        }

        if let Some(notes) = self.recent_notes() {
            prompt.push_str("\n## Recent Notes\n");
            prompt.push_str(&notes);
            prompt.push('\n');
        }

        prompt
    }

    fn recent_notes(&self) -> Option<String> {
        let path = self.notes_file.as_ref()?;
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                log::debug!("Notes not read from {}: {}", path.display(), e);
                return None;
            }
        };

        let content = content.trim();
        if content.is_empty() {
            return None;
        }
        Some(tail_chars(content, self.config.notes_max_chars).to_string())
    }
}

/// The last `max` characters of `text`, on a char boundary.
fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let start = text
        .char_indices()
        .nth(count - max)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{MockAgent, MockResponse};
    use crate::breaker::CircuitState;
    use crate::status::{END_MARKER, START_MARKER};
    use tempfile::TempDir;

    fn status_block(files: u32, exit_signal: bool) -> String {
        format!(
            "Did some work.\n{}\nSTATUS: IN_PROGRESS\nFILES_MODIFIED: {}\nEXIT_SIGNAL: {}\n{}\n",
            START_MARKER, files, exit_signal, END_MARKER
        )
    }

    fn controller(temp: &TempDir, agent: MockAgent, config: LoopControllerConfig) -> LoopController<MockAgent> {
        let layout = StateLayout::new(temp.path().join(".ralph"));
        LoopController::new(Arc::new(agent), &layout, "Build the thing.", config)
    }

    #[test]
    fn test_stop_reason_run_states() {
        assert_eq!(StopReason::MaxIterations.run_state(), RunState::Idle);
        assert_eq!(StopReason::CircuitOpen("x".into()).run_state(), RunState::CircuitOpen);
        assert_eq!(
            StopReason::ExitCondition(ExitReason::DoneSignals).run_state(),
            RunState::Complete
        );
        assert_eq!(StopReason::AgentFailedToStart("x".into()).run_state(), RunState::Error);
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("héllo wörld", 5), "wörld");
    }

    #[test]
    fn test_prepare_initializes_and_applies_limits() {
        let temp = TempDir::new().unwrap();
        let config = LoopControllerConfig {
            max_iterations: 7,
            max_calls_per_hour: 9,
            ..Default::default()
        };
        let ctl = controller(&temp, MockAgent::default(), config);

        let doc = ctl.prepare().unwrap();
        assert_eq!(doc.loop_state.max_iterations, 7);
        assert_eq!(doc.rate_limit.max_calls_per_hour, 9);
        assert!(!doc.session.session_id.is_empty());
        assert!(ctl.store().exists());
    }

    #[test]
    fn test_prepare_rejects_corrupt_state() {
        let temp = TempDir::new().unwrap();
        let ctl = controller(&temp, MockAgent::default(), LoopControllerConfig::default());
        fs::create_dir_all(temp.path().join(".ralph")).unwrap();
        fs::write(ctl.store().path(), "not json").unwrap();
        assert!(matches!(ctl.prepare(), Err(RalphError::StateCorrupt(_))));
    }

    #[test]
    fn test_prepare_rejects_zero_call_budget() {
        let temp = TempDir::new().unwrap();
        let config = LoopControllerConfig {
            max_calls_per_hour: 0,
            ..Default::default()
        };
        let ctl = controller(&temp, MockAgent::default(), config);
        assert!(matches!(ctl.prepare(), Err(RalphError::Config(_))));
    }

    #[tokio::test]
    async fn test_iteration_commits_state_and_history() {
        let temp = TempDir::new().unwrap();
        let agent = MockAgent::new(vec![AgentOutput::completed(status_block(2, false), 0)]);
        let ctl = controller(&temp, agent, LoopControllerConfig::default());

        let mut doc = ctl.prepare().unwrap();
        let decision = ctl.run_iteration(&mut doc).await.unwrap();
        assert_eq!(decision, IterationDecision::Continue);

        let stored = ctl.store().load().unwrap();
        assert_eq!(stored.loop_state.iteration, 1);
        assert_eq!(stored.loop_state.state, RunState::Running);
        assert_eq!(stored.rate_limit.calls_this_hour, 1);
        assert_eq!(stored.circuit_breaker.last_progress_loop, 1);
        assert!(stored.loop_state.last_status.unwrap().starts_with("IN_PROGRESS"));

        let history = ctl.history().session(&doc.session.session_id);
        let records = history.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].files_changed, 2);
        assert!(history.prompt_path(1).exists());
    }

    #[tokio::test]
    async fn test_context_includes_loop_state_and_notes() {
        let temp = TempDir::new().unwrap();
        let notes = temp.path().join("notes.md");
        fs::write(&notes, "remember: the API is flaky").unwrap();

        let agent = Arc::new(MockAgent::default());
        let layout = StateLayout::new(temp.path().join(".ralph"));
        let ctl = LoopController::new(agent.clone(), &layout, "Base prompt", LoopControllerConfig::default())
            .with_notes(&notes);

        let mut doc = ctl.prepare().unwrap();
        ctl.run_iteration(&mut doc).await.unwrap();

        let prompts = agent.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].starts_with("Base prompt"));
        assert!(prompts[0].contains("- Loop: 1 of 100"));
        assert!(prompts[0].contains("- Circuit breaker: CLOSED"));
        assert!(prompts[0].contains("remember: the API is flaky"));
    }

    #[tokio::test]
    async fn test_open_breaker_blocks_agent() {
        let temp = TempDir::new().unwrap();
        let agent = Arc::new(MockAgent::default());
        let layout = StateLayout::new(temp.path().join(".ralph"));
        let ctl = LoopController::new(agent.clone(), &layout, "p", LoopControllerConfig::default());

        let mut doc = ctl.prepare().unwrap();
        doc.circuit_breaker.state = CircuitState::Open;
        doc.circuit_breaker.open_reason = Some("No progress detected in 3 consecutive loops".to_string());

        let decision = ctl.run_iteration(&mut doc).await.unwrap();
        assert!(matches!(decision, IterationDecision::Stop(StopReason::CircuitOpen(_))));
        assert_eq!(agent.calls(), 0);
        assert_eq!(ctl.store().load().unwrap().loop_state.state, RunState::CircuitOpen);
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_error() {
        let temp = TempDir::new().unwrap();
        let agent = MockAgent::with_responses(vec![MockResponse::SpawnFailure("not found".to_string())]);
        let ctl = controller(&temp, agent, LoopControllerConfig::default());

        let reason = ctl.run().await.unwrap();
        assert!(matches!(reason, StopReason::AgentFailedToStart(_)));

        let stored = ctl.store().load().unwrap();
        assert_eq!(stored.loop_state.state, RunState::Error);
        assert_eq!(stored.loop_state.iteration, 0);
        assert_eq!(stored.rate_limit.calls_this_hour, 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_error() {
        let temp = TempDir::new().unwrap();
        let agent = MockAgent::new(vec![AgentOutput::timed_out(status_block(1, false))]);
        let ctl = controller(&temp, agent, LoopControllerConfig::default());

        let mut doc = ctl.prepare().unwrap();
        ctl.run_iteration(&mut doc).await.unwrap();
        assert_eq!(doc.circuit_breaker.consecutive_same_error, 1);
        let history = ctl.history().session(&doc.session.session_id);
        assert!(history.records().unwrap()[0].timed_out);
    }

    #[tokio::test]
    async fn test_max_iterations_stop() {
        let temp = TempDir::new().unwrap();
        let outputs = (0..3).map(|_| AgentOutput::completed(status_block(1, false), 0)).collect();
        let config = LoopControllerConfig {
            max_iterations: 3,
            ..Default::default()
        };
        let ctl = controller(&temp, MockAgent::new(outputs), config);

        assert_eq!(ctl.run().await.unwrap(), StopReason::MaxIterations);
        let stored = ctl.store().load().unwrap();
        assert_eq!(stored.loop_state.iteration, 3);
        assert_eq!(stored.loop_state.state, RunState::Idle);
    }

    #[tokio::test]
    async fn test_spent_budget_suspends_until_window_resets() {
        let temp = TempDir::new().unwrap();
        let agent = Arc::new(MockAgent::new(vec![AgentOutput::completed(status_block(1, false), 0)]));
        let layout = StateLayout::new(temp.path().join(".ralph"));
        let config = LoopControllerConfig {
            max_iterations: 1,
            max_calls_per_hour: 1,
            ..Default::default()
        };
        let ctl = LoopController::new(agent.clone(), &layout, "p", config);

        let mut seeded = ctl.prepare().unwrap();
        seeded.rate_limit.calls_this_hour = 1;
        seeded.rate_limit.hour_reset_timestamp = Some(Utc::now() + chrono::TimeDelta::milliseconds(400));
        ctl.store().save(&seeded).unwrap();

        let observe = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let waiting = ctl.store().load().unwrap();
            (agent.calls(), waiting.loop_state.last_status)
        };
        let (reason, (calls_while_waiting, status_while_waiting)) = tokio::join!(ctl.run(), observe);

        assert_eq!(calls_while_waiting, 0);
        assert!(status_while_waiting.unwrap().starts_with("rate limited"));
        assert_eq!(reason.unwrap(), StopReason::MaxIterations);
        assert_eq!(agent.calls(), 1);
        assert_eq!(ctl.store().load().unwrap().rate_limit.calls_this_hour, 1);
    }

    #[tokio::test]
    async fn test_open_breaker_with_spent_budget_stops_without_waiting() {
        let temp = TempDir::new().unwrap();
        let agent = Arc::new(MockAgent::default());
        let layout = StateLayout::new(temp.path().join(".ralph"));
        let ctl = LoopController::new(agent.clone(), &layout, "p", LoopControllerConfig::default());

        let mut doc = ctl.prepare().unwrap();
        doc.circuit_breaker.state = CircuitState::Open;
        doc.rate_limit.calls_this_hour = doc.rate_limit.max_calls_per_hour;
        doc.rate_limit.hour_reset_timestamp = Some(Utc::now() + chrono::TimeDelta::minutes(30));

        let decision = tokio::time::timeout(Duration::from_secs(2), ctl.run_iteration(&mut doc))
            .await
            .expect("open breaker must not wait for the rate limit")
            .unwrap();
        assert!(matches!(decision, IterationDecision::Stop(StopReason::CircuitOpen(_))));
        assert_eq!(agent.calls(), 0);
    }

    #[tokio::test]
    async fn test_repeated_errors_flag_stuck_loop() {
        let temp = TempDir::new().unwrap();
        let reply = format!("Error: linker failed\n{}", status_block(1, false));
        let outputs = (0..2).map(|_| AgentOutput::completed(reply.clone(), 0)).collect();
        let config = LoopControllerConfig {
            max_iterations: 2,
            stuck_window: 2,
            ..Default::default()
        };
        let ctl = controller(&temp, MockAgent::new(outputs), config);

        let mut doc = ctl.prepare().unwrap();
        ctl.run_iteration(&mut doc).await.unwrap();
        assert!(!doc.loop_state.last_status.clone().unwrap().contains("stuck"));

        ctl.run_iteration(&mut doc).await.unwrap();
        let stored = ctl.store().load().unwrap();
        assert!(stored.loop_state.last_status.unwrap().ends_with("(stuck: repeated errors)"));
        assert_eq!(stored.circuit_breaker.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_renewed_session_keeps_earlier_history() {
        let temp = TempDir::new().unwrap();
        let agent = MockAgent::new(vec![
            AgentOutput::completed(format!("first session\n{}", status_block(1, false)), 0),
            AgentOutput::completed(format!("second session\n{}", status_block(1, false)), 0),
        ]);
        let config = LoopControllerConfig {
            max_iterations: 1,
            ..Default::default()
        };
        let ctl = controller(&temp, agent, config);

        ctl.run().await.unwrap();
        let mut expired = ctl.store().load().unwrap();
        let first_session = expired.session.session_id.clone();
        expired.session.expires_at = Some(Utc::now() - chrono::TimeDelta::minutes(1));
        ctl.store().save(&expired).unwrap();

        ctl.run().await.unwrap();
        let renewed = ctl.store().load().unwrap();
        assert_ne!(renewed.session.session_id, first_session);
        assert_eq!(renewed.loop_state.iteration, 1);

        let old = ctl.history().session(&first_session);
        let new = ctl.history().session(&renewed.session.session_id);
        assert!(fs::read_to_string(old.output_path(1)).unwrap().starts_with("first session"));
        assert!(fs::read_to_string(new.output_path(1)).unwrap().starts_with("second session"));
        assert_eq!(old.records().unwrap().len(), 1);
    }

    /// Reads the committed call counter while the invocation is in flight
    struct CounterReadingAgent {
        store: StateStore,
        seen: std::sync::Mutex<Option<u32>>,
    }

    #[async_trait::async_trait]
    impl Agent for CounterReadingAgent {
        async fn invoke(&self, _prompt: &str, _timeout: Duration) -> Result<AgentOutput> {
            let calls = self.store.load()?.rate_limit.calls_this_hour;
            if let Ok(mut seen) = self.seen.lock() {
                *seen = Some(calls);
            }
            Ok(AgentOutput::completed(status_block(1, false), 0))
        }
    }

    #[tokio::test]
    async fn test_call_is_committed_before_invocation() {
        let temp = TempDir::new().unwrap();
        let layout = StateLayout::new(temp.path().join(".ralph"));
        let agent = Arc::new(CounterReadingAgent {
            store: layout.store(),
            seen: std::sync::Mutex::new(None),
        });
        let ctl = LoopController::new(agent.clone(), &layout, "p", LoopControllerConfig::default());

        let mut doc = ctl.prepare().unwrap();
        ctl.run_iteration(&mut doc).await.unwrap();

        assert_eq!(*agent.seen.lock().unwrap(), Some(1));
        assert_eq!(ctl.store().load().unwrap().rate_limit.calls_this_hour, 1);
    }
}
