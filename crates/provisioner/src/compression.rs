//! Compression strategies shared by the appender and artifact packaging.
//!
//! [`Compression`] is chosen once when an [`Appender`](crate::appender::Appender)
//! is opened. Each appended payload records the matching [`Codec`] in the
//! host file's index so it can be decoded without knowing how the writer was
//! configured.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Deflate compression level for appended payloads and ZIP packaging.
///
/// # Examples
///
/// ```
/// use provisioner::compression::CompressionLevel;
///
/// let fast = CompressionLevel::NONE;
/// let balanced = CompressionLevel::DEFAULT;
/// let small = CompressionLevel::MAX;
///
/// // Custom levels are clamped to 0-9
/// assert_eq!(CompressionLevel::new(12).level(), 9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    /// No compression (level 0).
    pub const NONE: CompressionLevel = CompressionLevel(0);

    /// Default compression (level 6).
    pub const DEFAULT: CompressionLevel = CompressionLevel(6);

    /// Maximum compression (level 9).
    pub const MAX: CompressionLevel = CompressionLevel(9);

    /// Creates a compression level from 0-9.
    ///
    /// Values greater than 9 are clamped to 9.
    #[must_use]
    pub fn new(level: u32) -> Self {
        CompressionLevel(level.min(9))
    }

    /// Returns the compression level value (0-9).
    #[must_use]
    pub fn level(&self) -> u32 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u32> for CompressionLevel {
    fn from(level: u32) -> Self {
        CompressionLevel::new(level)
    }
}

/// Write-side strategy selected when an appender is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Payloads are stored verbatim.
    #[default]
    None,
    /// Payloads are written as a single gzip member.
    Gzip(CompressionLevel),
}

impl Compression {
    /// Gzip at the default level, or no compression when `enabled` is false.
    pub fn gzip_if(enabled: bool) -> Self {
        if enabled {
            Compression::Gzip(CompressionLevel::DEFAULT)
        } else {
            Compression::None
        }
    }

    /// The codec recorded in the index for payloads written with this strategy.
    pub fn codec(&self) -> Codec {
        match self {
            Compression::None => Codec::None,
            Compression::Gzip(_) => Codec::Gzip,
        }
    }

    pub(crate) fn writer<W: Write>(&self, inner: W) -> PayloadWriter<W> {
        match self {
            Compression::None => PayloadWriter::Plain(inner),
            Compression::Gzip(level) => PayloadWriter::Gzip(GzEncoder::new(
                inner,
                flate2::Compression::new(level.level()),
            )),
        }
    }
}

/// Compression flag stored with each appended payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    None,
    Gzip,
}

impl Codec {
    /// Whether payloads with this codec are compressed.
    pub fn is_compressed(&self) -> bool {
        matches!(self, Codec::Gzip)
    }

    pub(crate) fn reader<R: Read>(&self, inner: R) -> PayloadReader<R> {
        match self {
            Codec::None => PayloadReader::Plain(inner),
            Codec::Gzip => PayloadReader::Gzip(GzDecoder::new(inner)),
        }
    }
}

pub(crate) enum PayloadWriter<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
}

impl<W: Write> PayloadWriter<W> {
    /// Flushes any buffered compressor state and hands back the sink.
    pub(crate) fn finish(self) -> io::Result<W> {
        match self {
            PayloadWriter::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            PayloadWriter::Gzip(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for PayloadWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            PayloadWriter::Plain(w) => w.write(buf),
            PayloadWriter::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            PayloadWriter::Plain(w) => w.flush(),
            PayloadWriter::Gzip(w) => w.flush(),
        }
    }
}

pub(crate) enum PayloadReader<R: Read> {
    Plain(R),
    Gzip(GzDecoder<R>),
}

impl<R: Read> Read for PayloadReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PayloadReader::Plain(r) => r.read(buf),
            PayloadReader::Gzip(r) => r.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(compression: Compression, data: &[u8]) -> Vec<u8> {
        let mut writer = compression.writer(Vec::new());
        writer.write_all(data).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn test_compression_level() {
        assert_eq!(CompressionLevel::NONE.level(), 0);
        assert_eq!(CompressionLevel::DEFAULT.level(), 6);
        assert_eq!(CompressionLevel::MAX.level(), 9);
        assert_eq!(CompressionLevel::new(15).level(), 9);
        assert_eq!(CompressionLevel::from(5).level(), 5);
    }

    #[test]
    fn test_plain_writer_is_passthrough() {
        let encoded = encode(Compression::None, b"hello");
        assert_eq!(encoded, b"hello");
    }

    #[test]
    fn test_gzip_round_trip() {
        let data = b"payload ".repeat(1000);
        let encoded = encode(Compression::Gzip(CompressionLevel::MAX), &data);
        assert!(encoded.len() < data.len());

        let mut decoded = Vec::new();
        Codec::Gzip
            .reader(&encoded[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_codec_matches_strategy() {
        assert_eq!(Compression::None.codec(), Codec::None);
        assert_eq!(Compression::gzip_if(true).codec(), Codec::Gzip);
        assert_eq!(Compression::gzip_if(false), Compression::None);
        assert!(Codec::Gzip.is_compressed());
        assert!(!Codec::None.is_compressed());
    }

    #[test]
    fn test_codec_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Codec::Gzip).unwrap(), "\"gzip\"");
        let codec: Codec = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(codec, Codec::None);
    }

    #[test]
    fn test_gzip_rejects_garbage() {
        let mut out = Vec::new();
        let result = Codec::Gzip.reader(&b"not gzip at all"[..]).read_to_end(&mut out);
        assert!(result.is_err());
    }
}
