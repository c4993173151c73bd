//! Plain-text alert artifact written when the breaker opens.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::Result;

/// Contents of an alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertNotice {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub total_opens: u32,
}

impl AlertNotice {
    fn render(&self) -> String {
        format!(
            "CIRCUIT BREAKER OPEN\n\
             timestamp: {}\n\
             reason: {}\n\
             total_opens: {}\n\
             \n\
             Investigate the recent iterations, then run `ralph reset` to resume in half-open state.\n",
            self.timestamp.to_rfc3339(),
            self.reason,
            self.total_opens
        )
    }
}

#[derive(Debug, Clone)]
pub struct AlertArtifact {
    path: PathBuf,
}

impl AlertArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn write(&self, notice: &AlertNotice) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, notice.render())?;
        Ok(())
    }

    /// Remove the alert; a missing file is not an error.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
