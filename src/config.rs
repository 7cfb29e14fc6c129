//! Configuration for a backup run.
//!
//! Loads settings from a TOML file; every section has serde defaults so a
//! minimal file (connection only) is enough to run. The resulting
//! [`BackupOptions`] is immutable for the duration of one run; the engine
//! only reads it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::utils::{EngineError, Result};

/// Database selection mode for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    /// One explicit database, one artifact.
    Single,
    /// One artifact per database, dumped from the primary replica.
    Primary,
    /// One artifact per database, dumped from a secondary replica.
    Secondary,
    /// All selected databases in one artifact.
    Combined,
    /// One artifact per selected database.
    Separated,
    /// Every database on the server, one artifact.
    All,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Single => "single",
            BackupMode::Primary => "primary",
            BackupMode::Secondary => "secondary",
            BackupMode::Combined => "combined",
            BackupMode::Separated => "separated",
            BackupMode::All => "all",
        }
    }

    /// Modes that iterate the database list, producing one artifact each.
    pub fn is_per_database(&self) -> bool {
        matches!(
            self,
            BackupMode::Separated | BackupMode::Single | BackupMode::Primary | BackupMode::Secondary
        )
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(BackupMode::Single),
            "primary" => Ok(BackupMode::Primary),
            "secondary" => Ok(BackupMode::Secondary),
            "combined" => Ok(BackupMode::Combined),
            "separated" => Ok(BackupMode::Separated),
            "all" => Ok(BackupMode::All),
            other => Err(EngineError::Config(format!("unknown backup mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database server hostname or IP
    pub host: String,

    /// Database server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Account used for the dump
    pub user: String,

    /// Password for the dump account
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Algorithm name (gzip, pgzip, zlib, zstd, xz, none)
    #[serde(default = "default_compression")]
    pub algorithm: String,

    /// Compression level (1-9, mapped to each codec's native scale)
    #[serde(default = "default_compression_level")]
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            enabled: false,
            algorithm: default_compression(),
            level: default_compression_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Key material; hashed to a 256-bit key before use
    #[serde(default)]
    pub key: String,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            enabled: false,
            key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    /// Path to the mysqldump binary. Resolved from PATH when unset.
    #[serde(default)]
    pub binary: Option<PathBuf>,

    /// Base arguments always passed to the dump binary
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Dump schema only (adds --no-data)
    #[serde(default)]
    pub schema_only: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        DumpConfig {
            binary: None,
            extra_args: Vec::new(),
            schema_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarConfig {
    /// Write `<artifact>.sha256` / `<artifact>.md5` checksum files
    #[serde(default)]
    pub checksum_files: bool,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        SidecarConfig { checksum_files: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: default_log_level() }
    }
}

/// Immutable-for-the-run configuration handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupOptions {
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub encryption: EncryptionConfig,

    #[serde(default)]
    pub dump: DumpConfig,

    #[serde(default)]
    pub sidecars: SidecarConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// Selection mode for the run
    #[serde(default = "default_mode")]
    pub mode: BackupMode,

    /// Log the dump invocation without executing it
    #[serde(default)]
    pub dry_run: bool,

    /// True when a name-convention filter trimmed the database list.
    /// Affects the --all-databases decision in the argument builder.
    #[serde(default)]
    pub filter_active: bool,

    /// Operator ticket / change reference recorded in the manifest
    #[serde(default)]
    pub ticket: Option<String>,
}

fn default_port() -> u16 {
    3306
}

fn default_compression() -> String {
    "zstd".to_string()
}

fn default_compression_level() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mode() -> BackupMode {
    BackupMode::Separated
}

impl BackupOptions {
    /// Load options from a TOML file
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let options: BackupOptions = toml::from_str(&content)?;
        options.validate()?;
        Ok(options)
    }

    /// Reject configurations the engine cannot act on.
    pub fn validate(&self) -> Result<()> {
        if self.connection.host.is_empty() {
            return Err(EngineError::Config("connection.host is empty".into()));
        }
        if self.connection.user.is_empty() {
            return Err(EngineError::Config("connection.user is empty".into()));
        }
        if self.encryption.enabled && self.encryption.key.is_empty() {
            return Err(EngineError::Config(
                "encryption is enabled but encryption.key is empty".into(),
            ));
        }
        if self.compression.enabled && !(1..=9).contains(&self.compression.level) {
            return Err(EngineError::Config(format!(
                "compression.level must be 1-9, got {}",
                self.compression.level
            )));
        }
        Ok(())
    }

    /// Locate the dump binary: explicit path first, then PATH lookup.
    pub fn dump_binary(&self) -> Result<PathBuf> {
        match &self.dump.binary {
            Some(path) => Ok(path.clone()),
            None => which::which("mysqldump")
                .map_err(|_| EngineError::DumpBinaryNotFound("mysqldump not found in PATH".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_options() -> BackupOptions {
        toml::from_str(
            r#"
            [connection]
            host = "db.example.com"
            user = "backup"
            password = "secret"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let opts = minimal_options();
        assert_eq!(opts.connection.port, 3306);
        assert_eq!(opts.mode, BackupMode::Separated);
        assert!(!opts.compression.enabled);
        assert_eq!(opts.compression.algorithm, "zstd");
        assert_eq!(opts.compression.level, 3);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn encryption_without_key_is_rejected() {
        let mut opts = minimal_options();
        opts.encryption.enabled = true;
        assert!(opts.validate().is_err());
        opts.encryption.key = "k".to_string();
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Combined".parse::<BackupMode>().unwrap(), BackupMode::Combined);
        assert!("weekly".parse::<BackupMode>().is_err());
        assert!(BackupMode::Primary.is_per_database());
        assert!(!BackupMode::Combined.is_per_database());
    }
}
