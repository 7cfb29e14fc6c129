//! Subprocess execution: mysqldump's stdout streamed straight into the
//! writer pipeline, stderr collected for classification.

use std::io;
use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pipeline::{self, ChecksumPair, StageConfig};
use crate::utils::{EngineError, Result};

/// Output of one dump invocation: what the process said and what went
/// through the pipeline. Consumed immediately by classification.
#[derive(Debug)]
pub struct BackupWriteResult {
    /// Captured stderr (diagnostics; orders of magnitude smaller than data)
    pub stderr: String,
    /// Raw dump bytes observed before compression/encryption
    pub bytes_written: u64,
    /// Digests of the raw dump stream
    pub checksums: ChecksumPair,
    /// Process exit code; `None` when killed by a signal
    pub exit_code: Option<i32>,
}

/// Run the dump binary once, wiring stdout into the composed pipeline.
///
/// Blocks until the process exits or `cancel` fires. On cancellation the
/// child is killed and [`EngineError::Cancelled`] is returned, a class
/// distinct from dump failures; the partially written artifact is left
/// for the caller's shutdown handler to remove.
pub async fn run_dump(
    binary: &Path,
    args: &[String],
    artifact: &Path,
    stages: &StageConfig,
    cancel: &CancellationToken,
) -> Result<BackupWriteResult> {
    debug!("Spawning {} with {} args", binary.display(), args.len());

    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::Io(io::Error::new(io::ErrorKind::Other, "child stdout missing")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EngineError::Io(io::Error::new(io::ErrorKind::Other, "child stderr missing")))?;

    // File::create truncates any partial file left by a prior attempt.
    let dest = std::fs::File::create(artifact)?;

    // The pipeline is synchronous Write stages; drive it from a blocking
    // task fed by a bridge over the async stdout handle. Data never lands
    // fully in memory.
    let stage_config = stages.clone();
    let writer_task = tokio::task::spawn_blocking(move || -> io::Result<(u64, ChecksumPair)> {
        let (mut writer, handle) = pipeline::compose(dest, &stage_config)?;
        let mut stdout_reader = SyncIoBridge::new(stdout);
        io::copy(&mut stdout_reader, &mut writer)?;
        writer.finish()?;
        Ok((handle.bytes_written(), handle.sums()))
    });

    let stderr_task = tokio::spawn(async move {
        let mut text = String::new();
        let mut reader = tokio::io::BufReader::new(stderr);
        let _ = reader.read_to_string(&mut text).await;
        text
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            child.start_kill().ok();
            let _ = child.wait().await;
            // Let both collectors drain before reporting cancellation so
            // no file handles leak into the next iteration.
            let _ = writer_task.await;
            let _ = stderr_task.await;
            return Err(EngineError::Cancelled);
        }
    };

    let stderr_text = stderr_task.await.unwrap_or_default();
    let (bytes_written, checksums) = writer_task
        .await
        .map_err(|e| EngineError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))??;

    Ok(BackupWriteResult {
        stderr: stderr_text,
        bytes_written,
        checksums,
        exit_code: status.code(),
    })
}
