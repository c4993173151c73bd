//! Append-only iteration history.
//!
//! Each iteration leaves two artifacts indexed by loop number (the prompt sent
//! and the raw output received) plus one line in `iterations.jsonl`. Loop
//! numbers restart with every session, so each session writes under its own
//! `history/<session_id>/` directory.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RalphError, Result};
use crate::id::{output_artifact_name, prompt_artifact_name};
use crate::status::WorkStatus;

const RECORDS_FILE: &str = "iterations.jsonl";

/// One committed iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub loop_number: u64,
    pub files_changed: u64,
    pub has_errors: bool,
    pub output_length: u64,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub status: WorkStatus,
    pub recorded_at: DateTime<Utc>,
    /// Lives in the output artifact, not in the JSONL line
    #[serde(skip)]
    pub raw_output: String,
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// History of one session, nested under this directory
    pub fn session(&self, session_id: &str) -> HistoryStore {
        HistoryStore::new(self.dir.join(session_id))
    }

    pub fn output_path(&self, loop_number: u64) -> PathBuf {
        self.dir.join(output_artifact_name(loop_number))
    }

    pub fn prompt_path(&self, loop_number: u64) -> PathBuf {
        self.dir.join(prompt_artifact_name(loop_number))
    }

    /// Save the prompt sent for an iteration.
    pub fn write_prompt(&self, loop_number: u64, prompt: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.prompt_path(loop_number);
        fs::write(&path, prompt)?;
        Ok(path)
    }

    /// Save the raw output artifact and append the record line.
    pub fn append(&self, record: &IterationRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.output_path(record.loop_number), &record.raw_output)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(RECORDS_FILE))?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    /// All record lines, in append order. Raw output is not loaded.
    pub fn records(&self) -> Result<Vec<IterationRecord>> {
        let path = self.dir.join(RECORDS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                records.push(serde_json::from_str(&line)?);
            }
        }
        Ok(records)
    }

    /// Raw output of the last `count` iterations, oldest first.
    pub fn recent_outputs(&self, count: usize) -> Result<Vec<String>> {
        let pattern = self.dir.join("loop_*_output.log");
        let pattern = pattern.to_string_lossy();
        let entries = glob::glob(&pattern).map_err(|e| RalphError::History(e.to_string()))?;

        let mut numbered: Vec<(u64, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|path| loop_number_of(&path).map(|n| (n, path)))
            .collect();
        numbered.sort_by_key(|(n, _)| *n);

        let skip = numbered.len().saturating_sub(count);
        numbered
            .into_iter()
            .skip(skip)
            .map(|(_, path)| fs::read_to_string(&path).map_err(RalphError::from))
            .collect()
    }
}

fn loop_number_of(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("loop_")?
        .strip_suffix("_output.log")?
        .parse()
        .ok()
}
