//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! Ensures that:
//! - A signal cancels the run at the next database boundary (or kills the
//!   in-flight dump through the cancellation token)
//! - A partially written artifact left by a killed dump is removed
//! - The manifest of the interrupted database is never written

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Slot recording the artifact currently being written, shared between
/// the engine and the shutdown handler.
#[derive(Debug, Clone, Default)]
pub struct ActiveArtifact {
    inner: Arc<Mutex<Option<PathBuf>>>,
}

impl ActiveArtifact {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `path` as in-flight; cleared again by [`Self::clear`].
    pub fn set(&self, path: PathBuf) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = Some(path);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = None;
        }
    }

    /// Delete whatever artifact was in flight, if any.
    pub fn remove_partial(&self) {
        let path = match self.inner.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(path) = path {
            if path.exists() {
                match std::fs::remove_file(&path) {
                    Ok(()) => info!("Removed partial artifact {}", path.display()),
                    Err(e) => {
                        warn!("Failed to remove partial artifact {}: {}", path.display(), e)
                    }
                }
            }
        }
    }
}

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    cancel: CancellationToken,
    active: ActiveArtifact,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            active: ActiveArtifact::new(),
        }
    }

    /// Token the engine polls between databases and during dumps
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Handle the engine updates with the artifact currently in flight
    pub fn active_artifact(&self) -> ActiveArtifact {
        self.active.clone()
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT), then cancel the run.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.cancel.cancel();
    }

    /// Clean up after a cancelled run.
    pub fn finalize(&self) {
        info!("Graceful shutdown initiated");
        self.active.remove_partial();
        info!("Graceful shutdown complete");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_cancellation_reaches_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.cancellation_token();

        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });

        coordinator.cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_partial_artifact_removed_once() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("inflight.sql.zst");
        fs::write(&partial, b"truncated").unwrap();

        let active = ActiveArtifact::new();
        active.set(partial.clone());
        active.remove_partial();
        assert!(!partial.exists());

        // Slot is consumed; a second call is a no-op.
        active.remove_partial();
    }

    #[test]
    fn test_clear_prevents_removal() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("done.sql");
        fs::write(&artifact, b"complete").unwrap();

        let active = ActiveArtifact::new();
        active.set(artifact.clone());
        active.clear();
        active.remove_partial();
        assert!(artifact.exists());
    }
}
