//! Dump execution: argument construction, subprocess streaming, error
//! classification and the two one-shot fix-up retries.

pub mod args;
pub mod classify;
pub mod runner;

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use args::build_dump_args;
pub use classify::{Outcome, WARNINGS_EXIT_CODE};
pub use runner::BackupWriteResult;

use crate::pipeline::StageConfig;
use crate::utils::{EngineError, Result};

/// A completed (possibly retried) dump for one unit of work.
#[derive(Debug)]
pub struct DumpOutcome {
    pub write: BackupWriteResult,
    pub outcome: Outcome,
    /// Flags removed or added by the fix-up retries, for the record
    pub applied_fixes: Vec<String>,
}

impl DumpOutcome {
    /// Warning text to carry into the manifest, if any.
    pub fn warning_text(&self) -> Option<&str> {
        match self.outcome {
            Outcome::NonFatal if !self.write.stderr.trim().is_empty() => {
                Some(self.write.stderr.trim())
            }
            _ => None,
        }
    }
}

/// Run the dump with automatic fix-up retries.
///
/// On a fatal classification, two narrow strategies each get one shot, in
/// order: disable TLS when the server does not speak it, then drop one
/// flag the tool rejected as unknown. Every retry starts from a freshly
/// truncated artifact. If the retries also fail, the *original* fatal
/// error is surfaced. On any fatal outcome the partial artifact is
/// deleted; on cancellation it is left for the shutdown handler.
pub async fn execute_dump(
    binary: &Path,
    initial_args: Vec<String>,
    artifact: &Path,
    stages: &StageConfig,
    cancel: &CancellationToken,
) -> Result<DumpOutcome> {
    let mut current_args = initial_args;
    let mut applied_fixes = Vec::new();
    let mut tried_tls = false;
    let mut tried_flag = false;
    let mut original_error: Option<EngineError> = None;

    loop {
        let write = match runner::run_dump(binary, &current_args, artifact, stages, cancel).await {
            Ok(write) => write,
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => {
                // I/O and spawn failures are not retryable.
                remove_partial(artifact);
                return Err(e);
            }
        };

        let outcome = classify::classify(write.exit_code, &write.stderr);
        if outcome != Outcome::Fatal {
            return Ok(DumpOutcome { write, outcome, applied_fixes });
        }

        if original_error.is_none() {
            original_error = Some(EngineError::DumpFailed {
                exit_code: write.exit_code,
                stderr: write.stderr.clone(),
            });
        }

        if !tried_tls {
            if let Some(retried) = classify::propose_tls_retry(&write.stderr, &current_args) {
                tried_tls = true;
                info!("Dump failed with a TLS mismatch; retrying once with {}", classify::TLS_DISABLE_FLAG);
                applied_fixes.push(classify::TLS_DISABLE_FLAG.to_string());
                current_args = retried;
                remove_partial(artifact);
                continue;
            }
        }

        if !tried_flag {
            if let Some(removal) = classify::propose_flag_removal(&write.stderr, &current_args) {
                tried_flag = true;
                info!("Dump rejected flag {}; retrying once without it", removal.removed);
                applied_fixes.push(format!("removed {}", removal.removed));
                current_args = removal.args;
                remove_partial(artifact);
                continue;
            }
        }

        remove_partial(artifact);
        // Retries exhausted (or never applicable): surface the first error.
        return Err(original_error.unwrap_or(EngineError::DumpFailed {
            exit_code: write.exit_code,
            stderr: write.stderr,
        }));
    }
}

/// Never leave a zero-byte or truncated artifact behind a fatal outcome.
fn remove_partial(artifact: &Path) {
    if artifact.exists() {
        if let Err(e) = std::fs::remove_file(artifact) {
            warn!("Failed to remove partial artifact {}: {}", artifact.display(), e);
        }
    }
}
