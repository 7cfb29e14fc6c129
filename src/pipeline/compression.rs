//! Compression stage constructors.
//!
//! Each algorithm is exposed as a stream-level writer over the next stage
//! down, with a portable 1-9 level mapped onto the codec's native scale.

use std::io::{self, Read, Write};
use std::str::FromStr;

use flate2::write::{GzEncoder, ZlibEncoder};
use xz2::write::XzEncoder;

use super::FinishWrite;
use crate::utils::{EngineError, Result};

/// Supported compression algorithms.
///
/// `Pgzip` is accepted for compatibility with artifacts named after the
/// parallel gzip tool; the produced stream is ordinary gzip either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    Gzip,
    Pgzip,
    Zlib,
    Zstd,
    Xz,
}

impl CompressionAlgorithm {
    /// File extension appended to the artifact name for this algorithm.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip | CompressionAlgorithm::Pgzip => "gz",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::Zstd => "zst",
            CompressionAlgorithm::Xz => "xz",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Pgzip => "pgzip",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::Zstd => "zstd",
            CompressionAlgorithm::Xz => "xz",
        }
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(CompressionAlgorithm::Gzip),
            "pgzip" => Ok(CompressionAlgorithm::Pgzip),
            "zlib" => Ok(CompressionAlgorithm::Zlib),
            "zstd" | "zst" => Ok(CompressionAlgorithm::Zstd),
            "xz" => Ok(CompressionAlgorithm::Xz),
            other => Err(EngineError::Compression(format!(
                "unknown compression algorithm: {}",
                other
            ))),
        }
    }
}

/// Map the portable 1-9 level onto zstd's native 1-22 scale.
fn zstd_level(level: u32) -> i32 {
    ((level as i32 * 22) / 9).max(1)
}

/// Clamp the level into flate2/xz range.
fn clamped(level: u32) -> u32 {
    level.clamp(1, 9)
}

/// Wrap `inner` in an encoder for `algo` at the portable level 1-9.
pub fn encoder(
    algo: CompressionAlgorithm,
    level: u32,
    inner: Box<dyn FinishWrite + Send>,
) -> io::Result<Box<dyn FinishWrite + Send>> {
    let stage: Box<dyn FinishWrite + Send> = match algo {
        CompressionAlgorithm::Gzip | CompressionAlgorithm::Pgzip => Box::new(GzipStage(
            GzEncoder::new(inner, flate2::Compression::new(clamped(level))),
        )),
        CompressionAlgorithm::Zlib => Box::new(ZlibStage(ZlibEncoder::new(
            inner,
            flate2::Compression::new(clamped(level)),
        ))),
        CompressionAlgorithm::Zstd => Box::new(ZstdStage(Some(zstd::stream::write::Encoder::new(
            inner,
            zstd_level(level),
        )?))),
        CompressionAlgorithm::Xz => Box::new(XzStage(XzEncoder::new(inner, clamped(level)))),
    };
    Ok(stage)
}

/// Wrap `inner` in the matching decoder for `algo`.
pub fn decoder(
    algo: CompressionAlgorithm,
    inner: Box<dyn Read + Send>,
) -> io::Result<Box<dyn Read + Send>> {
    let reader: Box<dyn Read + Send> = match algo {
        // MultiGzDecoder also handles multi-member streams from parallel
        // gzip tools.
        CompressionAlgorithm::Gzip | CompressionAlgorithm::Pgzip => {
            Box::new(flate2::read::MultiGzDecoder::new(inner))
        }
        CompressionAlgorithm::Zlib => Box::new(flate2::read::ZlibDecoder::new(inner)),
        CompressionAlgorithm::Zstd => Box::new(zstd::stream::read::Decoder::new(inner)?),
        CompressionAlgorithm::Xz => Box::new(xz2::read::XzDecoder::new(inner)),
    };
    Ok(reader)
}

struct GzipStage(GzEncoder<Box<dyn FinishWrite + Send>>);

impl Write for GzipStage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl FinishWrite for GzipStage {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let inner = self.0.finish()?;
        inner.finish()
    }
}

struct ZlibStage(ZlibEncoder<Box<dyn FinishWrite + Send>>);

impl Write for ZlibStage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl FinishWrite for ZlibStage {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let inner = self.0.finish()?;
        inner.finish()
    }
}

// Option dance: zstd's Encoder::finish takes self by value.
struct ZstdStage(Option<zstd::stream::write::Encoder<'static, Box<dyn FinishWrite + Send>>>);

impl Write for ZstdStage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.as_mut() {
            Some(enc) => enc.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "zstd encoder already finished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.as_mut() {
            Some(enc) => enc.flush(),
            None => Ok(()),
        }
    }
}

impl FinishWrite for ZstdStage {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        match self.0.take() {
            Some(enc) => {
                let inner = enc.finish()?;
                inner.finish()
            }
            None => Ok(()),
        }
    }
}

struct XzStage(XzEncoder<Box<dyn FinishWrite + Send>>);

impl Write for XzStage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl FinishWrite for XzStage {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let inner = self.0.finish()?;
        inner.finish()
    }
}

/// Decompress a complete in-memory stream. Used by verification tests and
/// small sidecar payloads; artifact verification streams instead.
pub fn decompress_all(algo: CompressionAlgorithm, data: &[u8]) -> io::Result<Vec<u8>> {
    let cursor: Box<dyn Read + Send> = Box::new(io::Cursor::new(data.to_vec()));
    let mut reader = decoder(algo, cursor)?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}
