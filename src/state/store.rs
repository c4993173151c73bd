//! JSON state store with dot-addressed access and atomic commits.
//!
//! Every write goes to a sibling temp file which is synced and then renamed
//! over the document, so a concurrent reader sees either the previous or the
//! new document in full.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use super::document::StateDocument;
use crate::error::{RalphError, Result};

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the raw document. A missing file is `Ok(None)`.
    fn read_raw(&self) -> Result<Option<Value>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let value: Value = serde_json::from_str(&content)
            .map_err(|e| RalphError::StateCorrupt(format!("{}: {}", self.path.display(), e)))?;
        if !value.is_object() {
            return Err(RalphError::StateCorrupt(format!(
                "{}: top level is not an object",
                self.path.display()
            )));
        }
        Ok(Some(value))
    }

    /// Value at a dot-separated path such as `circuit_breaker.state`.
    ///
    /// Absent paths, and a document that does not exist yet, yield `Value::Null`.
    /// An empty path returns the whole document.
    pub fn get(&self, path: &str) -> Result<Value> {
        let Some(doc) = self.read_raw()? else {
            return Ok(Value::Null);
        };
        Ok(lookup(&doc, path).cloned().unwrap_or(Value::Null))
    }

    /// Set the value at a dot-separated path: read, modify, then atomically replace.
    ///
    /// Intermediate objects are created as needed. The result must still be a
    /// valid state document.
    pub fn update(&self, path: &str, value: Value) -> Result<()> {
        let mut doc = self.read_raw()?.unwrap_or_else(|| Value::Object(Map::new()));
        assign(&mut doc, path, value)?;

        serde_json::from_value::<StateDocument>(doc.clone())
            .map_err(|e| RalphError::InvalidArgument(format!("update of '{}' rejected: {}", path, e)))?;

        self.write_atomic(&doc)?;
        log::debug!("Updated state path '{}'", path);
        Ok(())
    }

    /// Load the typed document; missing or corrupt documents are errors.
    pub fn load(&self) -> Result<StateDocument> {
        let doc = self
            .read_raw()?
            .ok_or_else(|| RalphError::StateMissing(format!("{} (run `ralph init`)", self.path.display())))?;
        serde_json::from_value(doc).map_err(|e| RalphError::StateCorrupt(format!("{}: {}", self.path.display(), e)))
    }

    /// Load for read-only consumers: anything unreadable is "no update yet".
    pub fn try_load(&self) -> Option<StateDocument> {
        match self.load() {
            Ok(doc) => Some(doc),
            Err(e) => {
                log::debug!("State not readable yet: {}", e);
                None
            }
        }
    }

    /// Commit the whole typed document.
    pub fn save(&self, doc: &StateDocument) -> Result<()> {
        let value = serde_json::to_value(doc)?;
        self.write_atomic(&value)
    }

    fn write_atomic(&self, value: &Value) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "state.json".to_string());
        let tmp_path = parent.join(format!(".{}.tmp-{}", file_name, std::process::id()));

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(serde_json::to_string_pretty(value)?.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }

        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(doc);
    }
    path.split('.').try_fold(doc, |current, key| current.as_object()?.get(key))
}

fn assign(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let keys: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = keys.split_last().filter(|_| keys.iter().all(|k| !k.is_empty())) else {
        return Err(RalphError::InvalidArgument(format!("invalid state path '{}'", path)));
    };
    let mut current = doc;
    for key in parents {
        let object = current
            .as_object_mut()
            .ok_or_else(|| RalphError::InvalidArgument(format!("'{}' crosses a non-object value", path)))?;
        current = object
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let object = current
        .as_object_mut()
        .ok_or_else(|| RalphError::InvalidArgument(format!("'{}' crosses a non-object value", path)))?;
    object.insert(last.to_string(), value);
    Ok(())
}
