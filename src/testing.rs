//! Fixtures for tests of split runs.
//!
//! Builders for small compressed inputs in the STRING-like layout the default
//! extractor expects, a configuration tuned for fast deterministic tests, and
//! helpers to inspect or damage an output directory.
//!
//! ```no_run
//! use ironshard::testing::*;
//! use ironshard::Runner;
//! # fn main() -> anyhow::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let input = dir.path().join("links.txt.gz");
//! write_gzip_input(&input, "protein1 protein2 score", &keyed_lines(&["9606", "10090"], 3))?;
//!
//! let out = dir.path().join("out");
//! let summary = Runner::new(test_config(&input, &out)).run()?;
//! assert_eq!(summary.keys_written, 2);
//! assert_eq!(shard_of(&out, "9606")?.unwrap().lines.len(), 3);
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::ProgressPolicy;
use crate::config::SplitConfig;
use crate::io::shard::{ShardContents, read_shard};
use crate::io::source::Decompressor;
use crate::naming::ShardNaming;
use crate::writer::glob_paths;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Header line used by the fixtures.
pub const SAMPLE_HEADER: &str = "protein1 protein2 combined_score";

/// `per_key` records for each key, interleaved round-robin so every chunk
/// touches many keys. Record `i` of key `k` is `"{k}.P{i} {k}.Q{i} {score}"`.
#[must_use]
pub fn keyed_lines(keys: &[&str], per_key: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(keys.len() * per_key);
    for i in 0..per_key {
        for key in keys {
            out.push(format!("{key}.P{i} {key}.Q{i} {}", 150 + i % 850));
        }
    }
    out
}

/// Write `header` and `lines` as a gzip file, one `\n` after each line.
///
/// # Errors
/// Returns an error if the file cannot be created or written.
#[cfg(feature = "compression-gzip")]
pub fn write_gzip_input<S: AsRef<str>>(path: &Path, header: &str, lines: &[S]) -> Result<()> {
    use flate2::{Compression, write::GzEncoder};

    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut enc = GzEncoder::new(f, Compression::fast());
    write_lines(&mut enc, header, lines)?;
    enc.finish()
        .with_context(|| format!("finish gzip {}", path.display()))?;
    Ok(())
}

/// Write `header` and `lines` uncompressed.
///
/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn write_plain_input<S: AsRef<str>>(path: &Path, header: &str, lines: &[S]) -> Result<()> {
    let mut f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    write_lines(&mut f, header, lines)
}

fn write_lines<W: Write, S: AsRef<str>>(w: &mut W, header: &str, lines: &[S]) -> Result<()> {
    writeln!(w, "{header}")?;
    for line in lines {
        writeln!(w, "{}", line.as_ref())?;
    }
    Ok(())
}

/// A configuration for tests: in-process decoding, two workers, tiny chunks,
/// progress saved only at the end.
#[must_use]
pub fn test_config(input: &Path, output_dir: &Path) -> SplitConfig {
    SplitConfig {
        input: input.to_path_buf(),
        output_dir: output_dir.to_path_buf(),
        workers: 2,
        chunk_size: 7,
        decompressor: Decompressor::InProcess,
        buffer_bytes: 64,
        flush_every_chunks: 3,
        progress_policy: ProgressPolicy::AtEnd,
        log_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

/// Read the final shard of `key` with the default naming, if present.
///
/// # Errors
/// Returns an error if the shard exists but cannot be decoded.
pub fn shard_of(dir: &Path, key: &str) -> Result<Option<ShardContents>> {
    ShardNaming::default()
        .locate(dir, key)
        .map(|path| read_shard(&path))
        .transpose()
}

/// Final shards in `dir`, by key.
///
/// # Errors
/// Returns an error if the directory cannot be listed.
pub fn list_shards(dir: &Path, naming: &ShardNaming) -> Result<BTreeMap<String, PathBuf>> {
    let mut out = BTreeMap::new();
    for path in glob_paths(&naming.final_glob(dir))? {
        let key = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| naming.parse_final(n));
        if let Some(key) = key {
            out.insert(key, path);
        }
    }
    Ok(out)
}

/// Temp artifacts in `dir`.
///
/// # Errors
/// Returns an error if the directory cannot be listed.
pub fn list_temps(dir: &Path, naming: &ShardNaming) -> Result<Vec<PathBuf>> {
    glob_paths(&naming.temp_glob(dir))
}

/// Leave behind what a killed process would: a temp artifact owned by `pid`
/// holding a compressed stream cut off mid-way.
///
/// # Errors
/// Returns an error if the file cannot be written.
#[cfg(feature = "compression-gzip")]
pub fn plant_crashed_temp(dir: &Path, naming: &ShardNaming, key: &str, pid: u32) -> Result<PathBuf> {
    let path = naming.temp_path(dir, key, pid);
    let full = gzip_bytes(&format!("{SAMPLE_HEADER}\n{key}.P0 {key}.Q0 500\n"))?;
    fs::write(&path, &full[..full.len() / 2]).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Overwrite `path` with the first half of its bytes.
///
/// # Errors
/// Returns an error if the file cannot be read or written.
pub fn truncate_half(path: &Path) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    fs::write(path, &bytes[..bytes.len() / 2]).with_context(|| format!("write {}", path.display()))
}

/// Gzip `text` in memory.
///
/// # Errors
/// Returns an error if compression fails.
#[cfg(feature = "compression-gzip")]
pub fn gzip_bytes(text: &str) -> Result<Vec<u8>> {
    use flate2::{Compression, write::GzEncoder};

    let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
    enc.write_all(text.as_bytes())?;
    Ok(enc.finish()?)
}
