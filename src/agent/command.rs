//! Agent backed by an external process.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::{Agent, AgentOutput};
use crate::config::AgentConfig;
use crate::error::{RalphError, Result};

/// Spawns `command args...` per call, writes the prompt to stdin and
/// captures stdout and stderr.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: String,
    args: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }
}

/// Bytes read from one pipe so far; readable even if the reader is still running
type Captured = Arc<Mutex<Vec<u8>>>;

fn capture<R>(mut reader: R) -> (Captured, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let captured = Captured::default();
    let sink = Arc::clone(&captured);
    let handle = tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Ok(mut buf) = sink.lock() {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
                Err(e) => {
                    log::warn!("Failed to read agent output: {}", e);
                    break;
                }
            }
        }
    });
    (captured, handle)
}

fn take(captured: &Option<Captured>) -> Vec<u8> {
    captured
        .as_ref()
        .and_then(|c| c.lock().ok().map(|mut buf| std::mem::take(&mut *buf)))
        .unwrap_or_default()
}

fn decode(bytes: Vec<u8>) -> (String, bool) {
    match String::from_utf8(bytes) {
        Ok(text) => (text, false),
        Err(e) => (String::from_utf8_lossy(e.as_bytes()).into_owned(), true),
    }
}

/// stdout followed by stderr, and whether either needed lossy decoding.
fn combine(stdout: Vec<u8>, stderr: Vec<u8>) -> (String, bool) {
    let (mut text, stdout_lossy) = decode(stdout);
    let (stderr, stderr_lossy) = decode(stderr);
    if !stderr.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    (text, stdout_lossy || stderr_lossy)
}

#[async_trait]
impl Agent for CommandAgent {
    async fn invoke(&self, prompt: &str, timeout: Duration) -> Result<AgentOutput> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RalphError::AgentSpawn(format!("{}: {}", self.command, e)))?;

        // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    log::warn!("Failed to write prompt to agent stdin: {}", e);
                }
            });
        }

        let (stdout, stdout_reader) = child.stdout.take().map(capture).unzip();
        let (stderr, stderr_reader) = child.stderr.take().map(capture).unzip();
        let mut readers: Vec<JoinHandle<()>> = stdout_reader.into_iter().chain(stderr_reader).collect();

        let finished = tokio::time::timeout(timeout, async {
            let status = child.wait().await;
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
            status
        })
        .await;

        match finished {
            Ok(Ok(status)) => {
                let (output, lossy) = combine(take(&stdout), take(&stderr));
                Ok(AgentOutput {
                    output,
                    exit_code: status.code(),
                    timed_out: false,
                    lossy,
                })
            }
            Ok(Err(e)) => {
                log::warn!("Failed to collect agent output: {}", e);
                Ok(AgentOutput {
                    output: format!("Error: failed to collect agent output: {}", e),
                    exit_code: None,
                    timed_out: false,
                    lossy: false,
                })
            }
            Err(_) => {
                log::warn!("Agent timed out after {}ms", timeout.as_millis());
                if let Err(e) = child.kill().await {
                    log::warn!("Failed to kill timed out agent: {}", e);
                }
                for reader in &readers {
                    reader.abort();
                }
                let (output, lossy) = combine(take(&stdout), take(&stderr));
                Ok(AgentOutput {
                    lossy,
                    ..AgentOutput::timed_out(output)
                })
            }
        }
    }
}
