//! Composable writer pipeline for backup artifacts.
//!
//! Stage order from producer to destination is fixed:
//! raw dump bytes → checksum tee → compression → encryption → file.
//! Encryption wraps the already-compressed bytes so ciphertext leaks no
//! compressibility patterns and the compressor never sees high-entropy
//! input. Disabled stages are simply not constructed; callers always see
//! a single composite writer.
//!
//! Streaming codecs and ciphers flush trailing blocks only on close, so
//! every stage implements [`FinishWrite`]: a consuming `finish()` that
//! writes its own trailer and then finishes the stage beneath it. Closing
//! the outermost writer therefore tears the chain down in strict reverse
//! construction order on every path.

pub mod checksum;
pub mod compression;
pub mod encryption;

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

pub use checksum::{ChecksumHandle, ChecksumPair, VerifyReport};
pub use compression::CompressionAlgorithm;

use crate::config::BackupOptions;
use crate::utils::{EngineError, Result};

/// A writer stage that must be explicitly finished to flush its trailer.
pub trait FinishWrite: Write {
    /// Flush trailing blocks, then finish the inner stage.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Transform stages active for a run, resolved from [`BackupOptions`].
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub compression: Option<(CompressionAlgorithm, u32)>,
    pub encryption_key: Option<String>,
}

impl StageConfig {
    /// No transform stages; the pipeline degenerates to a checksummed file.
    pub fn plain() -> Self {
        StageConfig { compression: None, encryption_key: None }
    }

    pub fn from_options(options: &BackupOptions) -> Result<Self> {
        let compression = if options.compression.enabled
            && options.compression.algorithm != "none"
        {
            Some((
                options.compression.algorithm.parse::<CompressionAlgorithm>()?,
                options.compression.level,
            ))
        } else {
            None
        };

        let encryption_key = if options.encryption.enabled {
            if options.encryption.key.is_empty() {
                return Err(EngineError::Config(
                    "encryption enabled without a key".into(),
                ));
            }
            Some(options.encryption.key.clone())
        } else {
            None
        };

        Ok(StageConfig { compression, encryption_key })
    }

    /// Logical extension chain for the active stages, e.g. `.sql.zst.enc`.
    pub fn extension_chain(&self) -> String {
        let mut ext = String::from(".sql");
        if let Some((algo, _)) = self.compression {
            ext.push('.');
            ext.push_str(algo.extension());
        }
        if self.encryption_key.is_some() {
            ext.push_str(".enc");
        }
        ext
    }
}

struct FileSink(File);

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl FinishWrite for FileSink {
    // The artifact must be durable before its manifest is written.
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.sync_all()
    }
}

/// Compose the active stages around `dest`.
///
/// Returns the outermost writer (the one the dump's stdout is copied
/// into) and the checksum handle that stays valid after the writer has
/// been finished.
pub fn compose(
    dest: File,
    config: &StageConfig,
) -> io::Result<(Box<dyn FinishWrite + Send>, ChecksumHandle)> {
    let mut stage: Box<dyn FinishWrite + Send> = Box::new(FileSink(dest));

    if let Some(key) = &config.encryption_key {
        stage = Box::new(encryption::AeadWriter::new(key, stage)?);
    }
    if let Some((algo, level)) = config.compression {
        stage = compression::encoder(algo, level, stage)?;
    }

    let (writer, handle) = checksum::ChecksumWriter::new(stage);
    Ok((Box::new(writer), handle))
}

/// Open an artifact and apply the inverse of the writer pipeline
/// (decrypt → decompress), yielding the plaintext dump stream.
pub fn open_plaintext_reader(
    artifact: &Path,
    config: &StageConfig,
) -> Result<Box<dyn Read + Send>> {
    let file = File::open(artifact)?;
    let mut reader: Box<dyn Read + Send> = Box::new(BufReader::new(file));

    if let Some(key) = &config.encryption_key {
        reader = Box::new(encryption::AeadReader::new(key, reader)?);
    }
    if let Some((algo, _)) = config.compression {
        reader = compression::decoder(algo, reader)?;
    }
    Ok(reader)
}

/// Verify an artifact against the digests recorded at write time.
pub fn verify_artifact(
    artifact: &Path,
    config: &StageConfig,
    expected: &ChecksumPair,
) -> Result<VerifyReport> {
    let plaintext = open_plaintext_reader(artifact, config)?;
    checksum::verify_stream(plaintext, expected)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// In-memory terminal stage for unit tests.
    pub(crate) struct VecSink(pub Arc<Mutex<Vec<u8>>>);

    impl Write for VecSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl FinishWrite for VecSink {
        fn finish(self: Box<Self>) -> io::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn collect_sink() -> (Box<dyn FinishWrite + Send>, Arc<Mutex<Vec<u8>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        (Box::new(VecSink(buf.clone())), buf)
    }

    fn stage_config(compression: Option<(&str, u32)>, key: Option<&str>) -> StageConfig {
        StageConfig {
            compression: compression
                .map(|(name, level)| (name.parse::<CompressionAlgorithm>().unwrap(), level)),
            encryption_key: key.map(str::to_owned),
        }
    }

    fn write_artifact(path: &Path, config: &StageConfig, data: &[u8]) -> ChecksumHandle {
        let file = File::create(path).unwrap();
        let (mut writer, handle) = compose(file, config).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap();
        handle
    }

    #[test]
    fn round_trip_matrix_over_compression_and_encryption() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..200_000u32).flat_map(|i| i.to_le_bytes()).collect();

        let compressions = [None, Some(("gzip", 6)), Some(("zlib", 4)), Some(("zstd", 3)), Some(("xz", 2))];
        let keys = [None, Some("hunter2")];

        for (i, comp) in compressions.iter().enumerate() {
            for (j, key) in keys.iter().enumerate() {
                let config = stage_config(*comp, *key);
                let path = dir.path().join(format!("artifact-{i}-{j}{}", config.extension_chain()));
                let handle = write_artifact(&path, &config, &payload);

                let mut plain = Vec::new();
                open_plaintext_reader(&path, &config)
                    .unwrap()
                    .read_to_end(&mut plain)
                    .unwrap();
                assert_eq!(plain, payload, "stages {comp:?}/{key:?} did not round-trip");

                let report = verify_artifact(&path, &config, &handle.sums()).unwrap();
                assert!(report.all_ok());
                assert_eq!(handle.bytes_written(), payload.len() as u64);
            }
        }
    }

    #[test]
    fn both_stages_disabled_is_a_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.sql");
        write_artifact(&path, &StageConfig::plain(), b"SELECT 1;\n");
        // No transform stages: the artifact on disk is the raw stream.
        assert_eq!(std::fs::read(&path).unwrap(), b"SELECT 1;\n");
    }

    #[test]
    fn extension_chain_reflects_active_stages() {
        assert_eq!(StageConfig::plain().extension_chain(), ".sql");
        assert_eq!(stage_config(Some(("zstd", 3)), None).extension_chain(), ".sql.zst");
        assert_eq!(
            stage_config(Some(("gzip", 6)), Some("k")).extension_chain(),
            ".sql.gz.enc"
        );
        assert_eq!(stage_config(None, Some("k")).extension_chain(), ".sql.enc");
    }

    #[test]
    fn corrupted_encrypted_artifact_fails_verification_not_silently() {
        let dir = tempfile::tempdir().unwrap();
        let config = stage_config(Some(("zstd", 3)), Some("k"));
        let path = dir.path().join(format!("db{}", config.extension_chain()));
        write_artifact(&path, &config, b"important rows");

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let mut out = Vec::new();
        let result = open_plaintext_reader(&path, &config)
            .unwrap()
            .read_to_end(&mut out);
        assert!(result.is_err());
    }
}
