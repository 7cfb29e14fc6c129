//! Heuristic classification of dump failures and one-shot retry fix-ups.
//!
//! Everything here is pure text inspection, kept separate from process
//! execution so the heuristics can be tested and swapped without
//! touching the runner.

/// Exit code the dump tool reserves for "completed with warnings".
pub const WARNINGS_EXIT_CODE: i32 = 2;

/// Flag appended by the TLS-mismatch retry.
pub const TLS_DISABLE_FLAG: &str = "--ssl-mode=DISABLED";

/// stderr fragments that leave the artifact usable.
const NON_FATAL_PATTERNS: &[&str] = &[
    "Warning:",
    "Couldn't read keys from",
    "references invalid table(s) or column(s) or function(s)",
];

/// stderr fragments that always mean the artifact must be discarded.
const HARD_FAILURE_PATTERNS: &[&str] = &[
    "Access denied",
    "Unknown database",
    "Unknown MySQL server host",
    "Connection refused",
    "Can't connect to MySQL server",
];

/// Outcome of one dump attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Clean exit, silent stderr.
    Success,
    /// Non-zero status or stderr chatter, but the artifact is usable.
    NonFatal,
    /// The artifact must be discarded.
    Fatal,
}

fn matches_any(stderr: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| stderr.contains(p))
}

/// Classify one attempt from its exit status and captured stderr.
///
/// Known limitation: non-fatal and hard-failure patterns are matched
/// against the same stderr blob. A hard failure is still recognized when
/// preceded by benign warning text, but only because the hard patterns
/// are checked subtractively, not because warnings and errors are
/// structurally separated.
pub fn classify(exit_code: Option<i32>, stderr: &str) -> Outcome {
    match exit_code {
        Some(0) if stderr.trim().is_empty() => Outcome::Success,
        Some(WARNINGS_EXIT_CODE) => Outcome::NonFatal,
        code => {
            if matches_any(stderr, HARD_FAILURE_PATTERNS) {
                Outcome::Fatal
            } else if matches_any(stderr, NON_FATAL_PATTERNS) {
                Outcome::NonFatal
            } else if code == Some(0) {
                // The tool exited cleanly; unrecognized chatter is treated
                // as warning text rather than grounds to discard the dump.
                Outcome::NonFatal
            } else {
                Outcome::Fatal
            }
        }
    }
}

/// True when stderr shows the client demanded TLS from a server that
/// does not speak it.
pub fn is_tls_mismatch(stderr: &str) -> bool {
    stderr.contains("SSL is required but the server doesn't support it")
        || stderr.contains("SSL connection error")
}

/// Synthesize the TLS-mismatch retry: the same invocation with TLS
/// disabled. Returns `None` when the flag is already present.
pub fn propose_tls_retry(stderr: &str, args: &[String]) -> Option<Vec<String>> {
    if !is_tls_mismatch(stderr) || args.iter().any(|a| a == TLS_DISABLE_FLAG) {
        return None;
    }
    let mut retried = args.to_vec();
    retried.push(TLS_DISABLE_FLAG.to_string());
    Some(retried)
}

/// A corrected argument list with the offending flag removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagRemoval {
    pub args: Vec<String>,
    pub removed: String,
}

/// Extract the offending token from an unknown-option/unknown-variable
/// message: quoted token first, else the first dash-prefixed token.
fn offending_token(stderr: &str) -> Option<String> {
    if let Some(start) = stderr.find('\'') {
        if let Some(len) = stderr[start + 1..].find('\'') {
            let token = &stderr[start + 1..start + 1 + len];
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    stderr
        .split_whitespace()
        .find(|t| t.starts_with('-'))
        .map(|t| t.trim_end_matches([',', '.', ';']).to_string())
}

fn flag_name(token: &str) -> &str {
    let trimmed = token.trim_start_matches('-');
    trimmed.split('=').next().unwrap_or(trimmed)
}

/// Synthesize the unsupported-flag retry: remove exactly the flag the
/// dump tool rejected (and its value, for two-token flags). Only tokens
/// beginning with a dash are eligible; a bare database name is never
/// removed. Reports which flag was dropped.
pub fn propose_flag_removal(stderr: &str, args: &[String]) -> Option<FlagRemoval> {
    if !stderr.contains("unknown variable") && !stderr.contains("unknown option") {
        return None;
    }
    let token = offending_token(stderr)?;

    let position = args.iter().position(|arg| {
        arg.starts_with('-')
            && (arg.trim_start_matches('-') == token.trim_start_matches('-')
                || flag_name(arg) == flag_name(&token))
    })?;

    let mut retried = args.to_vec();
    let removed = retried.remove(position);

    // Two-token flag: the value follows as its own argument. The final
    // argument is left alone because that is where a bare database name
    // would sit.
    if !removed.contains('=')
        && position < retried.len().saturating_sub(1)
        && !retried[position].starts_with('-')
    {
        retried.remove(position);
    }

    Some(FlagRemoval { args: retried, removed })
}
