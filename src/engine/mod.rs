//! Loop orchestration: drive the dump/pipeline/manifest machinery across
//! a database list, one at a time, in input order.
//!
//! The engine never parallelizes dumps. Per-database failures are
//! recorded and the loop moves on; only cancellation stops it early, and
//! the databases never reached are reported as one aggregate notice.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::BackupOptions;
use crate::dump::{self, build_dump_args, Outcome};
use crate::meta::{
    self, ArtifactInfo, BackupMetadata, BackupStatus, ChecksumInfo, DatabaseDetail, TimingInfo,
};
use crate::pipeline::{self, ChecksumPair, StageConfig};
use crate::shutdown::ActiveArtifact;
use crate::utils::{EngineError, Result};

/// Callback receiving error/warning text keyed by the artifact it
/// concerns. Lets a caller mirror problems somewhere the manifest is not
/// (a ticket system, a summary mail) without the engine knowing about it.
pub type ErrorSink = Arc<dyn Fn(&Path, &str) + Send + Sync>;

/// Maps a database name to the artifact path it should be dumped to.
/// Resolution failures count as failed databases, not run aborts.
pub type PathResolver = dyn Fn(&str) -> Result<PathBuf> + Send + Sync;

/// Per-invocation descriptor, created fresh for each unit of work and
/// never persisted.
#[derive(Debug, Clone)]
pub struct BackupExecutionConfig {
    /// Human-readable unit label (database name, or joined list)
    pub label: String,
    /// Databases this invocation covers
    pub databases: Vec<String>,
    /// Databases deliberately left out of an everything-mode run
    pub excluded: Vec<String>,
    /// Destination artifact path
    pub artifact: PathBuf,
    /// Set for a one-database unit; selects the bare-name argument rule
    pub single_database: Option<String>,
    /// Databases that exist on the server, for the --all-databases rule
    pub total_on_server: usize,
}

/// One successfully backed-up database (or combined set).
#[derive(Debug, Clone)]
pub struct DatabaseBackupInfo {
    pub database: String,
    pub artifact: PathBuf,
    /// On-disk artifact size after all stages
    pub size_bytes: u64,
    pub duration_secs: f64,
    /// Raw dump bytes per second, before compression
    pub throughput_bytes_per_sec: f64,
    pub status: BackupStatus,
    pub manifest: Option<PathBuf>,
}

/// One database the loop could not back up.
#[derive(Debug, Clone)]
pub struct FailedDatabaseInfo {
    pub database: String,
    pub error: String,
}

/// Aggregate result of one loop run.
#[derive(Debug, Default)]
pub struct BackupLoopResult {
    pub success: usize,
    pub failed: usize,
    pub successes: Vec<DatabaseBackupInfo>,
    pub failures: Vec<FailedDatabaseInfo>,
    /// Free-text error lines, in the order they occurred
    pub errors: Vec<String>,
}

impl BackupLoopResult {
    fn record_failure(&mut self, database: String, error: String) {
        self.errors.push(format!("{}: {}", database, error));
        self.failed += 1;
        self.failures.push(FailedDatabaseInfo { database, error });
    }

    /// Every input database is accounted for exactly once.
    pub fn attempted(&self) -> usize {
        self.success + self.failed
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Sequential backup driver for one configured run.
pub struct BackupEngine {
    options: BackupOptions,
    stages: StageConfig,
    binary: PathBuf,
    cancel: CancellationToken,
    active: ActiveArtifact,
    error_sink: Option<ErrorSink>,
}

impl BackupEngine {
    pub fn new(options: BackupOptions) -> Result<Self> {
        let stages = StageConfig::from_options(&options)?;
        // A dry run only prints the invocation, so a missing binary is
        // not a hard error there.
        let binary = match options.dump_binary() {
            Ok(path) => path,
            Err(_) if options.dry_run => PathBuf::from("mysqldump"),
            Err(e) => return Err(e),
        };
        Ok(Self {
            options,
            stages,
            binary,
            cancel: CancellationToken::new(),
            active: ActiveArtifact::new(),
            error_sink: None,
        })
    }

    /// Wire the engine to an externally owned cancellation token and
    /// in-flight artifact slot (normally the shutdown coordinator's).
    pub fn with_cancellation(mut self, cancel: CancellationToken, active: ActiveArtifact) -> Self {
        self.cancel = cancel;
        self.active = active;
        self
    }

    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.error_sink = Some(sink);
        self
    }

    pub fn stages(&self) -> &StageConfig {
        &self.stages
    }

    /// Back up each database into its own artifact.
    ///
    /// `total_on_server` is the number of databases that exist on the
    /// server, used by the argument builder's `--all-databases` decision.
    pub async fn run_separated(
        &self,
        databases: &[String],
        total_on_server: usize,
        resolve: &PathResolver,
    ) -> BackupLoopResult {
        let mut result = BackupLoopResult::default();

        for (index, database) in databases.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.record_cancelled_remainder(&mut result, &databases[index..]);
                break;
            }

            let artifact = match resolve(database) {
                Ok(path) => path,
                Err(e) => {
                    let text = format!("failed to resolve backup path: {}", e);
                    error!("Skipping {}: {}", database, text);
                    self.sink(Path::new(database), &text);
                    result.record_failure(database.clone(), text);
                    continue;
                }
            };

            let exec = BackupExecutionConfig {
                label: database.clone(),
                databases: vec![database.clone()],
                excluded: Vec::new(),
                artifact,
                single_database: Some(database.clone()),
                total_on_server,
            };

            match self.dump_to_artifact(&exec).await {
                Ok(info) => {
                    result.success += 1;
                    result.successes.push(info);
                }
                Err(EngineError::Cancelled) => {
                    self.record_cancelled_remainder(&mut result, &databases[index..]);
                    break;
                }
                Err(e) => {
                    let text = e.to_string();
                    error!("Backup of {} failed: {}", database, text);
                    self.sink(&exec.artifact, &text);
                    result.record_failure(database.clone(), text);
                }
            }
        }

        info!(
            "Backup loop finished: {} succeeded, {} failed of {} attempted",
            result.success,
            result.failed,
            result.attempted()
        );
        result
    }

    /// Back up the whole list into one artifact with one manifest.
    ///
    /// `excluded` names databases deliberately left out of an
    /// everything-mode run; they are recorded in the manifest.
    pub async fn run_combined(
        &self,
        databases: &[String],
        excluded: &[String],
        total_on_server: usize,
        artifact: &Path,
    ) -> Result<DatabaseBackupInfo> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let exec = BackupExecutionConfig {
            label: databases.join(","),
            databases: databases.to_vec(),
            excluded: excluded.to_vec(),
            artifact: artifact.to_path_buf(),
            single_database: None,
            total_on_server,
        };
        self.dump_to_artifact(&exec).await
    }

    /// Shared body of the separated and combined paths: run the dump
    /// (or log it, in a dry run), then write manifest and sidecars.
    async fn dump_to_artifact(
        &self,
        exec: &BackupExecutionConfig,
    ) -> Result<DatabaseBackupInfo> {
        let args = build_dump_args(
            &self.options.connection,
            self.options.filter_active,
            &exec.databases,
            exec.single_database.as_deref(),
            exec.total_on_server,
            self.options.dump.schema_only,
            &self.options.dump.extra_args,
        );
        let label = exec.label.as_str();
        let artifact = exec.artifact.as_path();
        let started_at = Utc::now();
        let clock = Instant::now();

        if self.options.dry_run {
            info!(
                "[dry run] {} {}",
                self.binary.display(),
                redact_args(&args).join(" ")
            );
            let finished_at = Utc::now();
            let metadata = self.build_metadata(
                artifact,
                exec.databases.clone(),
                exec.excluded.clone(),
                TimingInfo {
                    started_at,
                    finished_at,
                    duration_secs: 0.0,
                },
                0,
                &ChecksumPair {
                    sha256: String::new(),
                    md5: String::new(),
                },
                BackupStatus::DryRun,
                None,
            );
            let manifest = self.persist_manifest(&metadata);
            return Ok(DatabaseBackupInfo {
                database: label.to_string(),
                artifact: artifact.to_path_buf(),
                size_bytes: 0,
                duration_secs: 0.0,
                throughput_bytes_per_sec: 0.0,
                status: BackupStatus::DryRun,
                manifest,
            });
        }

        info!("Backing up {} -> {}", label, artifact.display());
        self.active.set(artifact.to_path_buf());

        let outcome =
            dump::execute_dump(&self.binary, args, artifact, &self.stages, &self.cancel)
                .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(EngineError::Cancelled) => {
                // Partial artifact stays in the slot for the shutdown
                // handler to remove.
                return Err(EngineError::Cancelled);
            }
            Err(e) => {
                self.active.clear();
                return Err(e);
            }
        };

        self.active.clear();
        let finished_at = Utc::now();
        let duration_secs = clock.elapsed().as_secs_f64();

        let status = match outcome.outcome {
            Outcome::Success => BackupStatus::Success,
            Outcome::NonFatal => BackupStatus::SuccessWithWarnings,
            // execute_dump never returns Ok on a fatal classification
            Outcome::Fatal => BackupStatus::Failed,
        };

        if let Some(warning) = outcome.warning_text() {
            warn!("{} completed with warnings: {}", label, warning);
            self.sink(artifact, warning);
        }
        if !outcome.applied_fixes.is_empty() {
            info!("{} needed fix-up retries: {}", label, outcome.applied_fixes.join("; "));
        }

        let size_bytes = std::fs::metadata(artifact).map(|m| m.len()).unwrap_or(0);
        let raw_bytes = outcome.write.bytes_written;
        let throughput = if duration_secs > 0.0 {
            raw_bytes as f64 / duration_secs
        } else {
            0.0
        };

        let metadata = self.build_metadata(
            artifact,
            exec.databases.clone(),
            exec.excluded.clone(),
            TimingInfo {
                started_at,
                finished_at,
                duration_secs,
            },
            size_bytes,
            &outcome.write.checksums,
            status,
            outcome.warning_text().map(str::to_string),
        );
        let manifest = self.persist_manifest(&metadata);

        if self.options.sidecars.checksum_files {
            if let Err(e) = pipeline::checksum::write_checksum_sidecars(
                artifact,
                &outcome.write.checksums,
            ) {
                warn!("Failed to write checksum sidecars for {}: {}", artifact.display(), e);
            }
        }

        info!(
            "Finished {} ({} bytes on disk, {:.1}s, {:.0} B/s raw)",
            label, size_bytes, duration_secs, throughput
        );

        Ok(DatabaseBackupInfo {
            database: label.to_string(),
            artifact: artifact.to_path_buf(),
            size_bytes,
            duration_secs,
            throughput_bytes_per_sec: throughput,
            status,
            manifest,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_metadata(
        &self,
        artifact: &Path,
        databases: Vec<String>,
        excluded: Vec<String>,
        timing: TimingInfo,
        size_bytes: u64,
        checksums: &ChecksumPair,
        status: BackupStatus,
        warnings: Option<String>,
    ) -> BackupMetadata {
        let database_details = databases
            .iter()
            .map(|name| DatabaseDetail {
                name: name.clone(),
                status,
            })
            .collect();
        BackupMetadata {
            backup_file: artifact.to_path_buf(),
            backup_type: self.options.mode.as_str().to_string(),
            databases,
            excluded_databases: excluded,
            database_details,
            host: self.options.connection.host.clone(),
            timing,
            artifact: ArtifactInfo {
                size_bytes,
                compressed: self.stages.compression.is_some(),
                compression_algorithm: self
                    .stages
                    .compression
                    .map(|(algo, _)| algo.as_str().to_string()),
                encrypted: self.stages.encryption_key.is_some(),
            },
            checksum: ChecksumInfo {
                algorithm: "sha256".to_string(),
                sha256: checksums.sha256.clone(),
                md5: checksums.md5.clone(),
            },
            status,
            replication: None,
            sidecars: None,
            warnings,
            ticket: self.options.ticket.clone(),
        }
    }

    /// Manifest persistence is best-effort: a manifest write failure must
    /// never turn a finished backup into a failed one.
    fn persist_manifest(&self, metadata: &BackupMetadata) -> Option<PathBuf> {
        match meta::store(metadata) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(
                    "Failed to write manifest for {}: {}",
                    metadata.backup_file.display(),
                    e
                );
                None
            }
        }
    }

    fn record_cancelled_remainder(&self, result: &mut BackupLoopResult, remaining: &[String]) {
        if remaining.is_empty() {
            return;
        }
        let names = remaining.join(", ");
        warn!("Cancelled; {} database(s) not backed up: {}", remaining.len(), names);
        result.failed += remaining.len();
        result
            .errors
            .push(format!("cancelled before completion: {}", names));
        result.failures.push(FailedDatabaseInfo {
            database: names,
            error: "cancelled before completion".to_string(),
        });
    }

    fn sink(&self, artifact: &Path, text: &str) {
        if let Some(sink) = &self.error_sink {
            sink(artifact, text);
        }
    }
}

/// Argument vector safe for logging.
fn redact_args(args: &[String]) -> Vec<String> {
    args.iter()
        .map(|a| {
            if a.starts_with("--password=") {
                "--password=***".to_string()
            } else {
                a.clone()
            }
        })
        .collect()
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::dump::runner::tests::fake_dump;
    use sha2::{Digest, Sha256};
    use std::sync::Mutex;

    fn options_with_binary(binary: &Path) -> BackupOptions {
        let mut options: BackupOptions = toml::from_str(
            r#"
            [connection]
            host = "db.internal"
            user = "backup"
            password = "pw"
            "#,
        )
        .unwrap();
        options.dump.binary = Some(binary.to_path_buf());
        options
    }

    #[tokio::test]
    async fn loop_isolates_a_fatal_database_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        // The database name is the last argument; db2 fails hard.
        let script = fake_dump(
            dir.path(),
            r#"for last; do :; done
if [ "$last" = "db2" ]; then
  printf 'mysqldump: Got error: 1044: Access denied for user\n' >&2
  exit 1
fi
printf -- "-- dump of %s\n" "$last""#,
        );

        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink_seen = seen.clone();
        let engine = BackupEngine::new(options_with_binary(&script))
            .unwrap()
            .with_error_sink(Arc::new(move |path, text| {
                sink_seen
                    .lock()
                    .unwrap()
                    .push(format!("{}: {}", path.display(), text));
            }));

        let out_dir = dir.path().to_path_buf();
        let databases: Vec<String> =
            ["db1", "db2", "db3"].iter().map(|s| s.to_string()).collect();
        let result = engine
            .run_separated(&databases, 10, &move |db| Ok(out_dir.join(format!("{db}.sql"))))
            .await;

        assert_eq!(result.success, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.attempted(), 3);
        assert_eq!(result.failures[0].database, "db2");
        assert!(result.failures[0].error.contains("Access denied"));

        // Successful artifacts and manifests exist; the failed one is gone.
        assert!(dir.path().join("db1.sql").exists());
        assert!(!dir.path().join("db2.sql").exists());
        assert!(dir.path().join("db3.sql.meta.json").exists());

        let sunk = seen.lock().unwrap();
        assert_eq!(sunk.len(), 1);
        assert!(sunk[0].contains("db2.sql"));
    }

    #[tokio::test]
    async fn end_to_end_compressed_encrypted_backup_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_dump(
            dir.path(),
            "printf 'CREATE TABLE t (id INT);\\nINSERT INTO t VALUES (1);\\n'",
        );

        let mut options = options_with_binary(&script);
        options.compression.enabled = true;
        options.compression.algorithm = "zstd".to_string();
        options.compression.level = 3;
        options.encryption.enabled = true;
        options.encryption.key = "k".to_string();
        options.sidecars.checksum_files = true;

        let engine = BackupEngine::new(options).unwrap();
        let out_dir = dir.path().to_path_buf();
        let stages = engine.stages().clone();
        assert_eq!(stages.extension_chain(), ".sql.zst.enc");

        let databases = vec!["orders".to_string()];
        let result = engine
            .run_separated(&databases, 5, &move |db| {
                Ok(out_dir.join(format!("{db}.sql.zst.enc")))
            })
            .await;

        assert_eq!(result.success, 1);
        let info = &result.successes[0];
        assert_eq!(info.status, BackupStatus::Success);
        assert!(info.size_bytes > 0);

        // Manifest digests match an independent hash of the plaintext.
        let plaintext = "CREATE TABLE t (id INT);\nINSERT INTO t VALUES (1);\n";
        let expected_sha = format!("{:x}", Sha256::digest(plaintext.as_bytes()));
        let manifest = meta::load(info.manifest.as_ref().unwrap()).unwrap();
        assert_eq!(manifest.checksum.sha256, expected_sha);
        assert!(manifest.artifact.compressed);
        assert!(manifest.artifact.encrypted);

        // And the artifact decrypts/decompresses back to those digests.
        let pair = ChecksumPair {
            sha256: manifest.checksum.sha256.clone(),
            md5: manifest.checksum.md5.clone(),
        };
        let report = pipeline::verify_artifact(&info.artifact, &stages, &pair).unwrap();
        assert!(report.all_ok());

        // Checksum sidecars were requested.
        assert!(dir.path().join("orders.sql.zst.enc.sha256").exists());
        assert!(dir.path().join("orders.sql.zst.enc.md5").exists());
    }

    #[tokio::test]
    async fn combined_run_puts_every_database_in_one_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_dump(dir.path(), "printf -- '-- combined dump\\n'");
        let engine = BackupEngine::new(options_with_binary(&script)).unwrap();

        let artifact = dir.path().join("all.sql");
        let databases = vec!["a".to_string(), "b".to_string()];
        let excluded = vec!["mysql".to_string()];
        let info = engine
            .run_combined(&databases, &excluded, 10, &artifact)
            .await
            .unwrap();

        assert_eq!(info.database, "a,b");
        let manifest = meta::load(&meta::manifest_path(&artifact)).unwrap();
        assert_eq!(manifest.databases, databases);
        assert_eq!(manifest.excluded_databases, excluded);
        assert_eq!(manifest.database_details.len(), 2);
    }

    #[tokio::test]
    async fn filtered_combined_selection_never_widens_to_all_databases() {
        let dir = tempfile::tempdir().unwrap();
        // Echo the invocation into the artifact so the selection arguments
        // the dump tool actually received can be asserted on.
        let script = fake_dump(dir.path(), r#"printf '%s\n' "$@""#);

        let mut options = options_with_binary(&script);
        options.filter_active = true;
        let engine = BackupEngine::new(options).unwrap();

        let artifact = dir.path().join("combined.sql");
        let databases = vec!["a".to_string(), "b".to_string()];
        engine
            .run_combined(&databases, &[], databases.len(), &artifact)
            .await
            .unwrap();

        let argv = std::fs::read_to_string(&artifact).unwrap();
        assert!(argv.contains("--databases\na\nb"), "argv was: {argv}");
        assert!(!argv.contains("--all-databases"));

        // The manifest and the artifact describe the same selection.
        let manifest = meta::load(&meta::manifest_path(&artifact)).unwrap();
        assert_eq!(manifest.databases, databases);
    }

    #[tokio::test]
    async fn dry_run_writes_a_manifest_but_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_dump(dir.path(), "exit 99");
        let mut options = options_with_binary(&script);
        options.dry_run = true;

        let engine = BackupEngine::new(options).unwrap();
        let out_dir = dir.path().to_path_buf();
        let databases = vec!["orders".to_string()];
        let result = engine
            .run_separated(&databases, 5, &move |db| Ok(out_dir.join(format!("{db}.sql"))))
            .await;

        assert_eq!(result.success, 1);
        assert_eq!(result.successes[0].status, BackupStatus::DryRun);
        assert_eq!(result.successes[0].size_bytes, 0);
        assert!(!dir.path().join("orders.sql").exists());
        let manifest = meta::load(&dir.path().join("orders.sql.meta.json")).unwrap();
        assert_eq!(manifest.status, BackupStatus::DryRun);
    }

    #[tokio::test]
    async fn cancellation_reports_remaining_databases_in_one_notice() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_dump(dir.path(), "printf 'x\\n'");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let engine = BackupEngine::new(options_with_binary(&script))
            .unwrap()
            .with_cancellation(cancel, ActiveArtifact::new());

        let out_dir = dir.path().to_path_buf();
        let databases: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let result = engine
            .run_separated(&databases, 3, &move |db| Ok(out_dir.join(format!("{db}.sql"))))
            .await;

        assert_eq!(result.success, 0);
        assert_eq!(result.failed, 3);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].database, "a, b, c");
    }

    #[test]
    fn password_is_redacted_in_logged_invocations() {
        let args = vec![
            "--host=h".to_string(),
            "--password=hunter2".to_string(),
            "orders".to_string(),
        ];
        let redacted = redact_args(&args);
        assert_eq!(redacted[1], "--password=***");
        assert_eq!(redacted[2], "orders");
    }
}
