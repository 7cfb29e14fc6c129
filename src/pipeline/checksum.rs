//! Streaming checksum accumulation and post-write verification.
//!
//! The accumulator is a transparent tee: it observes every plaintext byte
//! on its way into the pipeline and feeds two digests at once, so
//! multi-gigabyte artifacts are never read twice.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use md5::Md5;
use sha2::{Digest, Sha256};

use super::FinishWrite;
use crate::utils::Result;

/// Hex-encoded digests of one completed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumPair {
    pub sha256: String,
    pub md5: String,
}

struct DigestState {
    sha256: Sha256,
    md5: Md5,
    bytes: u64,
}

/// Shared handle to the accumulator state; survives the writer so digests
/// can be read after the pipeline has been finished and dropped.
#[derive(Clone)]
pub struct ChecksumHandle {
    state: Arc<Mutex<DigestState>>,
}

impl ChecksumHandle {
    fn new() -> Self {
        ChecksumHandle {
            state: Arc::new(Mutex::new(DigestState {
                sha256: Sha256::new(),
                md5: Md5::new(),
                bytes: 0,
            })),
        }
    }

    /// Hex digests of everything written so far.
    pub fn sums(&self) -> ChecksumPair {
        let state = self.state.lock().expect("checksum state poisoned");
        ChecksumPair {
            sha256: format!("{:x}", state.sha256.clone().finalize()),
            md5: format!("{:x}", state.md5.clone().finalize()),
        }
    }

    /// Raw (pre-compression, pre-encryption) bytes observed.
    pub fn bytes_written(&self) -> u64 {
        self.state.lock().expect("checksum state poisoned").bytes
    }

    fn update(&self, data: &[u8]) {
        let mut state = self.state.lock().expect("checksum state poisoned");
        state.sha256.update(data);
        state.md5.update(data);
        state.bytes += data.len() as u64;
    }
}

/// Pass-through writer stage updating both digests.
pub struct ChecksumWriter {
    inner: Box<dyn FinishWrite + Send>,
    handle: ChecksumHandle,
}

impl ChecksumWriter {
    pub fn new(inner: Box<dyn FinishWrite + Send>) -> (Self, ChecksumHandle) {
        let handle = ChecksumHandle::new();
        let writer = ChecksumWriter { inner, handle: handle.clone() };
        (writer, handle)
    }
}

impl Write for ChecksumWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.handle.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl FinishWrite for ChecksumWriter {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.inner.finish()
    }
}

/// Per-algorithm outcome of verifying an artifact against recorded digests.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub sha256_ok: bool,
    pub md5_ok: bool,
    pub computed: ChecksumPair,
}

impl VerifyReport {
    pub fn all_ok(&self) -> bool {
        self.sha256_ok && self.md5_ok
    }
}

/// Recompute both digests over a plaintext reader and compare against the
/// digests recorded at write time. Mismatches are reported per algorithm
/// so a decrypt problem can be told apart from a decompress problem.
pub fn verify_stream(mut plaintext: impl Read, expected: &ChecksumPair) -> Result<VerifyReport> {
    let mut sha256 = Sha256::new();
    let mut md5 = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = plaintext.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha256.update(&buf[..n]);
        md5.update(&buf[..n]);
    }
    let computed = ChecksumPair {
        sha256: format!("{:x}", sha256.finalize()),
        md5: format!("{:x}", md5.finalize()),
    };
    Ok(VerifyReport {
        sha256_ok: computed.sha256 == expected.sha256,
        md5_ok: computed.md5 == expected.md5,
        computed,
    })
}

/// Write `<artifact>.sha256` and `<artifact>.md5` sidecars in the common
/// checksum-tool format: `"<hex digest>  <basename>\n"` (two spaces), so
/// `sha256sum -c` and friends can verify independently.
pub fn write_checksum_sidecars(artifact: &Path, sums: &ChecksumPair) -> Result<()> {
    let basename = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    for (ext, digest) in [("sha256", &sums.sha256), ("md5", &sums.md5)] {
        let sidecar = sidecar_path(artifact, ext);
        std::fs::write(&sidecar, format!("{}  {}\n", digest, basename))?;
    }
    Ok(())
}

fn sidecar_path(artifact: &Path, ext: &str) -> std::path::PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    std::path::PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::collect_sink;

    #[test]
    fn known_vectors_for_both_digests() {
        let (sink, passthrough) = collect_sink();
        let (mut writer, handle) = ChecksumWriter::new(sink);
        writer.write_all(b"abc").unwrap();
        Box::new(writer).finish().unwrap();

        let sums = handle.sums();
        assert_eq!(
            sums.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sums.md5, "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(handle.bytes_written(), 3);
        assert_eq!(passthrough.lock().unwrap().as_slice(), b"abc");
    }

    #[test]
    fn verify_reports_per_algorithm() {
        let expected = ChecksumPair {
            sha256: "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into(),
            md5: "not-the-right-md5".into(),
        };
        let report = verify_stream(io::Cursor::new(b"abc".to_vec()), &expected).unwrap();
        assert!(report.sha256_ok);
        assert!(!report.md5_ok);
        assert!(!report.all_ok());
    }

    #[test]
    fn sidecar_format_matches_checksum_tools() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("orders.sql.zst");
        std::fs::write(&artifact, b"x").unwrap();

        let sums = ChecksumPair { sha256: "aa".into(), md5: "bb".into() };
        write_checksum_sidecars(&artifact, &sums).unwrap();

        let sha_line = std::fs::read_to_string(dir.path().join("orders.sql.zst.sha256")).unwrap();
        assert_eq!(sha_line, "aa  orders.sql.zst\n");
        let md5_line = std::fs::read_to_string(dir.path().join("orders.sql.zst.md5")).unwrap();
        assert_eq!(md5_line, "bb  orders.sql.zst\n");
    }
}
