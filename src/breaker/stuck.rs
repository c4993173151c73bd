//! Stuck-loop diagnostic: the same error lines repeating across iterations.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

static ERROR_RE: OnceLock<Regex> = OnceLock::new();
static FIELD_RE: OnceLock<Regex> = OnceLock::new();

fn error_re() -> &'static Regex {
    ERROR_RE.get_or_init(|| {
        Regex::new(
            r"^\s*(Error|ERROR|error)(\[[A-Z]?\d+\])?:|\]: error|\b(FATAL|Fatal error|panicked at|Segmentation fault)\b|Traceback \(most recent call last\)",
        )
        .expect("static error pattern")
    })
}

fn field_re() -> &'static Regex {
    FIELD_RE.get_or_init(|| Regex::new(r#"^\s*(")?([A-Za-z0-9_-]+)(")?\s*:"#).expect("static field pattern"))
}

/// A `key: value` line whose key merely contains "error" (`is_error`,
/// `"error": null`, `ERROR_COUNT: 0`) is a structured field, not an error.
fn is_error_field(line: &str) -> bool {
    let Some(caps) = field_re().captures(line) else {
        return false;
    };
    let key = caps.get(2).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
    let quoted = caps.get(1).is_some();
    key.contains("error") && (quoted || key != "error")
}

/// Distinct error-like lines in one iteration's output, trimmed.
pub fn error_lines(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter(|line| error_re().is_match(line) && !is_error_field(line))
        .map(|line| line.trim().to_string())
        .collect()
}

/// True iff the last `window` outputs all share the exact same non-empty set
/// of error lines. Fewer than `window` outputs is never stuck.
pub fn detect_stuck_loop<S: AsRef<str>>(recent_outputs: &[S], window: usize) -> bool {
    if window == 0 || recent_outputs.len() < window {
        return false;
    }

    let inspected = &recent_outputs[recent_outputs.len() - window..];
    let first = error_lines(inspected[0].as_ref());
    if first.is_empty() {
        return false;
    }

    inspected[1..].iter().all(|output| error_lines(output.as_ref()) == first)
}
