//! Provenance manifests.
//!
//! Every artifact gets a `<artifact>.meta.json` sidecar describing what
//! was dumped, when, through which stages, and with which digests.
//! Manifests are written with write-temp-then-rename so a reader never
//! observes a half-written file: either the old manifest is intact or the
//! new one is fully in place. Amendments are read-modify-atomic-rewrite,
//! never in-place mutation.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use tempfile::NamedTempFile;

use crate::utils::{EngineError, Result};

/// Manifest sidecar suffix.
pub const MANIFEST_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Success,
    SuccessWithWarnings,
    Failed,
    DryRun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingInfo {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub size_bytes: u64,
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_algorithm: Option<String>,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumInfo {
    /// Primary algorithm recorded for external verification
    pub algorithm: String,
    pub sha256: String,
    pub md5: String,
}

/// Replication position captured alongside the backup; opaque to the
/// engine, recorded for point-in-time consistency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid_executed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_log_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_log_pos: Option<u64>,
}

/// Paths to sibling files produced next to the main artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SidecarPaths {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grants_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid_file: Option<PathBuf>,
}

/// One row per database in a combined artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseDetail {
    pub name: String,
    pub status: BackupStatus,
}

/// The durable manifest, grouped by concern. Writers always emit this
/// shape; see [`load`] for the historical flat shape readers tolerate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Always matches the artifact this manifest sits beside
    pub backup_file: PathBuf,
    pub backup_type: String,
    pub databases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_databases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub database_details: Vec<DatabaseDetail>,
    pub host: String,
    pub timing: TimingInfo,
    pub artifact: ArtifactInfo,
    pub checksum: ChecksumInfo,
    pub status: BackupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecars: Option<SidecarPaths>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
}

/// Flat manifest layout emitted by earlier releases.
#[derive(Debug, Clone, Deserialize)]
struct FlatMetadata {
    backup_file: PathBuf,
    backup_type: String,
    databases: Vec<String>,
    #[serde(default)]
    excluded_databases: Vec<String>,
    host: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    duration_secs: f64,
    size_bytes: u64,
    #[serde(default)]
    compressed: bool,
    #[serde(default)]
    compression_algorithm: Option<String>,
    #[serde(default)]
    encrypted: bool,
    #[serde(default = "default_checksum_algorithm")]
    checksum_algorithm: String,
    sha256: String,
    md5: String,
    status: BackupStatus,
    #[serde(default)]
    warnings: Option<String>,
}

fn default_checksum_algorithm() -> String {
    "sha256".to_string()
}

impl From<FlatMetadata> for BackupMetadata {
    fn from(flat: FlatMetadata) -> Self {
        BackupMetadata {
            backup_file: flat.backup_file,
            backup_type: flat.backup_type,
            databases: flat.databases,
            excluded_databases: flat.excluded_databases,
            database_details: Vec::new(),
            host: flat.host,
            timing: TimingInfo {
                started_at: flat.started_at,
                finished_at: flat.finished_at,
                duration_secs: flat.duration_secs,
            },
            artifact: ArtifactInfo {
                size_bytes: flat.size_bytes,
                compressed: flat.compressed,
                compression_algorithm: flat.compression_algorithm,
                encrypted: flat.encrypted,
            },
            checksum: ChecksumInfo {
                algorithm: flat.checksum_algorithm,
                sha256: flat.sha256,
                md5: flat.md5,
            },
            status: flat.status,
            replication: None,
            sidecars: None,
            warnings: flat.warnings,
            ticket: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestDoc {
    Grouped(BackupMetadata),
    Flat(FlatMetadata),
}

/// Path of the manifest sitting beside `artifact`.
pub fn manifest_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(MANIFEST_SUFFIX);
    PathBuf::from(name)
}

/// Read a manifest, accepting both the grouped shape and the historical
/// flat layout.
pub fn load(manifest: &Path) -> Result<BackupMetadata> {
    let content = std::fs::read_to_string(manifest)?;
    let doc: ManifestDoc = serde_json::from_str(&content)?;
    Ok(match doc {
        ManifestDoc::Grouped(meta) => meta,
        ManifestDoc::Flat(flat) => flat.into(),
    })
}

/// Atomically persist `metadata` beside its artifact: serialize to a
/// temporary file in the same directory, then rename over the manifest
/// path. Rename-over-existing is atomic on POSIX; the temp file lives in
/// the target directory so the rename never crosses filesystems.
pub fn store(metadata: &BackupMetadata) -> Result<PathBuf> {
    let path = manifest_path(&metadata.backup_file);
    let dir = path
        .parent()
        .ok_or_else(|| EngineError::Manifest(format!("manifest path has no parent: {}", path.display())))?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, metadata)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(&path)
        .map_err(|e| EngineError::Manifest(format!("failed to persist manifest: {}", e)))?;
    Ok(path)
}

/// Replace the database-name list and per-database detail rows of an
/// existing manifest. Used when a combined artifact's membership is only
/// known after filtering.
pub fn update_databases(
    artifact: &Path,
    databases: Vec<String>,
    details: Vec<DatabaseDetail>,
) -> Result<()> {
    let mut metadata = load(&manifest_path(artifact))?;
    metadata.databases = databases;
    metadata.database_details = details;
    store(&metadata)?;
    Ok(())
}

/// Attach the resolved path of a grants-export sidecar discovered after
/// the main artifact was written.
pub fn attach_grants_file(artifact: &Path, grants: &Path) -> Result<()> {
    let mut metadata = load(&manifest_path(artifact))?;
    metadata
        .sidecars
        .get_or_insert_with(SidecarPaths::default)
        .grants_file = Some(grants.to_path_buf());
    store(&metadata)?;
    Ok(())
}
