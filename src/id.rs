//! ID and timestamp utilities for Ralph
//!
//! Provides the opaque session identifier and the artifact names used for
//! per-iteration history files.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use sha2::{Digest, Sha256};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate an opaque session identifier
///
/// Format: first 16 hex chars of `sha256(timestamp_nanos | pid | counter)`
/// Example: `3f9c1a0b7d42e611`
pub fn generate_session_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(counter.to_le_bytes());
    let digest = hasher.finalize();

    hex::encode(&digest[..8])
}

/// File name of the raw output artifact for an iteration
///
/// Example: for loop 7: `loop_0007_output.log`
pub fn output_artifact_name(loop_number: u64) -> String {
    format!("loop_{:04}_output.log", loop_number)
}

/// File name of the prompt artifact for an iteration
pub fn prompt_artifact_name(loop_number: u64) -> String {
    format!("loop_{:04}_prompt.md", loop_number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_session_id_format() {
        let id = generate_session_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_session_id_uniqueness() {
        let id1 = generate_session_id();
        let id2 = generate_session_id();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_artifact_names_padding() {
        assert_eq!(output_artifact_name(7), "loop_0007_output.log");
        assert_eq!(prompt_artifact_name(12), "loop_0012_prompt.md");
        assert_eq!(output_artifact_name(12345), "loop_12345_output.log");
    }
}
