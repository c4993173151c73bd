//! Configuration for Ralph.
//!
//! Loaded from `--config <path>`, `./.ralph.yml` or `~/.config/ralph/ralph.yml`,
//! falling back to defaults.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::breaker::BreakerThresholds;
use crate::exit::ExitThresholds;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    /// Directory holding the state document and every artifact
    pub state_dir: PathBuf,
    pub agent: AgentConfig,
    #[serde(rename = "loop")]
    pub loop_: LoopConfig,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub exit: ExitConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable invoked once per iteration; the prompt is written to its stdin
    pub command: String,
    pub args: Vec<String>,
    pub timeout_ms: u64,
    pub prompt_file: PathBuf,
    /// Free-form notes appended to every prompt (tail only)
    pub notes_file: Option<PathBuf>,
    pub notes_max_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["--print".to_string()],
            timeout_ms: 15 * 60 * 1000,
            prompt_file: PathBuf::from("PROMPT.md"),
            notes_file: None,
            notes_max_chars: 4000,
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub max_iterations: u64,
    pub session_expiry_hours: i64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            session_expiry_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub no_progress_threshold: u32,
    pub same_error_threshold: u32,
    pub output_decline_threshold_pct: i64,
    /// Number of recent iterations inspected by the stuck-loop check
    pub stuck_window: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        let thresholds = BreakerThresholds::default();
        Self {
            no_progress_threshold: thresholds.no_progress,
            same_error_threshold: thresholds.same_error,
            output_decline_threshold_pct: thresholds.output_decline_pct,
            stuck_window: 5,
        }
    }
}

impl BreakerConfig {
    pub fn thresholds(&self) -> BreakerThresholds {
        BreakerThresholds {
            no_progress: self.no_progress_threshold,
            same_error: self.same_error_threshold,
            output_decline_pct: self.output_decline_threshold_pct,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_calls_per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_calls_per_hour: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    pub completion_threshold: u32,
    pub test_only_threshold: u32,
    pub done_signal_threshold: u32,
}

impl Default for ExitConfig {
    fn default() -> Self {
        let thresholds = ExitThresholds::default();
        Self {
            completion_threshold: thresholds.completion_indicators,
            test_only_threshold: thresholds.test_only_loops,
            done_signal_threshold: thresholds.done_signals,
        }
    }
}

impl ExitConfig {
    pub fn thresholds(&self) -> ExitThresholds {
        ExitThresholds {
            completion_indicators: self.completion_threshold,
            test_only_loops: self.test_only_threshold,
            done_signals: self.done_signal_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 2000 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            state_dir: PathBuf::from(".ralph"),
            agent: AgentConfig::default(),
            loop_: LoopConfig::default(),
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            exit: ExitConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project config: ./.ralph.yml
        let project_config = PathBuf::from(".ralph.yml");
        if project_config.exists() {
            match Self::load_from_file(&project_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", project_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/ralph/ralph.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let user_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.state_dir, PathBuf::from(".ralph"));
        assert_eq!(config.agent.timeout(), Duration::from_secs(900));
        assert_eq!(config.loop_.max_iterations, 100);
        assert_eq!(config.breaker.no_progress_threshold, 3);
        assert_eq!(config.breaker.same_error_threshold, 5);
        assert_eq!(config.breaker.output_decline_threshold_pct, 70);
        assert_eq!(config.breaker.stuck_window, 5);
        assert_eq!(config.rate_limit.max_calls_per_hour, 100);
        assert_eq!(config.exit.completion_threshold, 2);
        assert_eq!(config.exit.test_only_threshold, 3);
        assert_eq!(config.exit.done_signal_threshold, 2);
        assert_eq!(config.monitor.poll_interval_ms, 2000);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ralph.yml");
        fs::write(
            &path,
            r#"
state_dir: /tmp/ralph-state
agent:
  command: my-agent
loop:
  max_iterations: 7
rate_limit:
  max_calls_per_hour: 12
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/ralph-state"));
        assert_eq!(config.agent.command, "my-agent");
        assert_eq!(config.agent.timeout_ms, 900000);
        assert_eq!(config.loop_.max_iterations, 7);
        assert_eq!(config.loop_.session_expiry_hours, 24);
        assert_eq!(config.rate_limit.max_calls_per_hour, 12);
        assert_eq!(config.exit.completion_threshold, 2);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let path = PathBuf::from("/nonexistent/ralph.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_thresholds_mapping() {
        let mut config = Config::default();
        config.breaker.no_progress_threshold = 4;
        config.exit.done_signal_threshold = 9;
        assert_eq!(config.breaker.thresholds().no_progress, 4);
        assert_eq!(config.exit.thresholds().done_signals, 9);
    }
}
