//! Pluggable compression for the input stream and the shard files.
//!
//! ## Architecture
//!
//! - [`CompressionCodec`] - one implementation per algorithm
//! - Detection via file extension first, then magic bytes
//! - [`FinishWrite`] - encoders that must be explicitly finished, so a shard
//!   is never promoted with a truncated trailer
//!
//! ## Built-in Codecs
//!
//! - **Gzip** (`.gz`) - via `flate2` (feature: `compression-gzip`)
//! - **Zstd** (`.zst`) - via `zstd` (feature: `compression-zstd`)
//!
//! ## Concatenated streams
//!
//! Shards that were evicted and reopened consist of several compressed
//! members appended back to back. Readers here decode all members: gzip goes
//! through `MultiGzDecoder`, and the zstd decoder handles consecutive frames
//! natively.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

/// A writer whose stream needs an explicit trailer.
///
/// Dropping an encoder without calling [`FinishWrite::finish`] may leave an
/// unterminated stream; the shard writer always finishes before renaming.
pub trait FinishWrite: Write {
    fn finish(self: Box<Self>) -> std::io::Result<()>;
}

/// Pluggable compression codec.
pub trait CompressionCodec: Send + Sync {
    /// Human-readable codec name (e.g., "gzip", "zstd").
    fn name(&self) -> &str;

    /// File extensions associated with this codec, lowercase with leading dot.
    fn extensions(&self) -> &[&str];

    /// Magic byte signature for content-based detection.
    fn magic_bytes(&self) -> Option<&[u8]>;

    /// Wrap a reader with decompression.
    fn wrap_reader_dyn(
        &self,
        reader: Box<dyn Read + Send>,
    ) -> std::io::Result<Box<dyn Read + Send>>;

    /// Open a compressing encoder on top of `file` at the given level.
    fn encoder(&self, file: File, level: u32) -> std::io::Result<Box<dyn FinishWrite>>;
}

/// Built-in codecs, in detection order.
fn builtin_codecs() -> Vec<&'static dyn CompressionCodec> {
    vec![
        #[cfg(feature = "compression-gzip")]
        &GzipCodec,
        #[cfg(feature = "compression-zstd")]
        &ZstdCodec,
    ]
}

/// Detect a codec from the file name (case-insensitive, last extension wins
/// through `ends_with`, so `.txt.gz` is gzip).
#[must_use]
pub fn detect_from_extension(path: impl AsRef<Path>) -> Option<&'static dyn CompressionCodec> {
    let path_str = path.as_ref().to_string_lossy().to_lowercase();
    builtin_codecs()
        .into_iter()
        .find(|codec| codec.extensions().iter().any(|ext| path_str.ends_with(ext)))
}

/// Detect a codec by peeking at the start of a buffered stream. The reader is
/// not advanced.
fn detect_from_magic<R: BufRead>(reader: &mut R) -> Option<&'static dyn CompressionCodec> {
    let buf = reader.fill_buf().ok()?;
    if buf.is_empty() {
        return None;
    }
    builtin_codecs().into_iter().find(|codec| {
        codec
            .magic_bytes()
            .is_some_and(|magic| buf.len() >= magic.len() && buf.starts_with(magic))
    })
}

/// Detect the codec of an existing file: extension, then magic bytes.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn detect_codec(path: &Path) -> Result<Option<&'static dyn CompressionCodec>> {
    if let Some(codec) = detect_from_extension(path) {
        return Ok(Some(codec));
    }
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut r = BufReader::new(f);
    Ok(detect_from_magic(&mut r))
}

/// Automatically detect and wrap a reader with decompression if needed.
///
/// Detection strategy:
/// 1. Check the path hint's extension
/// 2. Fall back to magic bytes
/// 3. Return the (buffered) reader unchanged if nothing matches
///
/// # Errors
/// Returns an error if the codec fails to initialise on the stream.
pub fn auto_detect_reader<R: Read + Send + 'static>(
    reader: R,
    path_hint: impl AsRef<Path>,
) -> Result<Box<dyn Read + Send>> {
    if let Some(codec) = detect_from_extension(&path_hint) {
        return codec
            .wrap_reader_dyn(Box::new(reader))
            .with_context(|| format!("wrap reader with {} codec", codec.name()));
    }

    let mut buf_reader = BufReader::new(reader);
    if let Some(codec) = detect_from_magic(&mut buf_reader) {
        return codec
            .wrap_reader_dyn(Box::new(buf_reader))
            .with_context(|| format!("wrap reader with {} codec", codec.name()));
    }

    Ok(Box::new(buf_reader))
}

/// Open a compressing encoder for a shard file, choosing the codec from the
/// shard path's extension.
///
/// # Errors
/// Returns an error if no compiled-in codec matches the extension, or the
/// encoder cannot be created.
pub fn shard_encoder(file: File, path_hint: &Path, level: u32) -> Result<Box<dyn FinishWrite>> {
    let codec = detect_from_extension(path_hint).with_context(|| {
        format!("no compression codec for shard name {}", path_hint.display())
    })?;
    codec
        .encoder(file, level)
        .with_context(|| format!("open {} encoder for {}", codec.name(), path_hint.display()))
}

// ============================================================================
// Built-in Codec Implementations
// ============================================================================

#[cfg(feature = "compression-gzip")]
struct GzipCodec;

#[cfg(feature = "compression-gzip")]
impl FinishWrite for flate2::write::GzEncoder<File> {
    fn finish(self: Box<Self>) -> std::io::Result<()> {
        let file = (*self).finish()?;
        file.sync_all()
    }
}

#[cfg(feature = "compression-gzip")]
impl CompressionCodec for GzipCodec {
    fn name(&self) -> &str {
        "gzip"
    }

    fn extensions(&self) -> &[&str] {
        &[".gz", ".gzip"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x1f, 0x8b])
    }

    fn wrap_reader_dyn(
        &self,
        reader: Box<dyn Read + Send>,
    ) -> std::io::Result<Box<dyn Read + Send>> {
        use flate2::read::MultiGzDecoder;
        Ok(Box::new(MultiGzDecoder::new(BufReader::new(reader))))
    }

    fn encoder(&self, file: File, level: u32) -> std::io::Result<Box<dyn FinishWrite>> {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        Ok(Box::new(GzEncoder::new(file, Compression::new(level.min(9)))))
    }
}

#[cfg(feature = "compression-zstd")]
struct ZstdCodec;

#[cfg(feature = "compression-zstd")]
impl FinishWrite for zstd::stream::write::Encoder<'static, File> {
    fn finish(self: Box<Self>) -> std::io::Result<()> {
        let file = (*self).finish()?;
        file.sync_all()
    }
}

#[cfg(feature = "compression-zstd")]
impl CompressionCodec for ZstdCodec {
    fn name(&self) -> &str {
        "zstd"
    }

    fn extensions(&self) -> &[&str] {
        &[".zst", ".zstd"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x28, 0xb5, 0x2f, 0xfd])
    }

    fn wrap_reader_dyn(
        &self,
        reader: Box<dyn Read + Send>,
    ) -> std::io::Result<Box<dyn Read + Send>> {
        zstd::stream::read::Decoder::new(reader).map(|d| Box::new(d) as Box<dyn Read + Send>)
    }

    #[allow(clippy::cast_possible_wrap)]
    fn encoder(&self, file: File, level: u32) -> std::io::Result<Box<dyn FinishWrite>> {
        zstd::stream::write::Encoder::new(file, level.min(22) as i32)
            .map(|e| Box::new(e) as Box<dyn FinishWrite>)
    }
}
