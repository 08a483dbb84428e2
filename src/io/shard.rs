//! Reading finished shards back.
//!
//! This is the lookup side of the naming contract: downstream readers find a
//! key's shard with [`ShardNaming::locate`](crate::naming::ShardNaming::locate)
//! and stream it with [`open_shard`]. The resume scan uses the same path for
//! its full-read integrity check.

use crate::io::compression::auto_detect_reader;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Open a shard for line-oriented reading, decompressing transparently.
///
/// # Errors
/// Returns an error if the file cannot be opened or its codec initialised.
pub fn open_shard(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let rdr = auto_detect_reader(f, path)
        .with_context(|| format!("setup decompression for {}", path.display()))?;
    Ok(Box::new(BufReader::new(rdr)))
}

/// Header and data lines of a shard.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShardContents {
    pub header: String,
    pub lines: Vec<String>,
}

/// Read a whole shard into memory.
///
/// # Errors
/// Returns an error if the shard cannot be decoded or is not UTF-8.
pub fn read_shard(path: &Path) -> Result<ShardContents> {
    let reader = open_shard(path)?;
    let mut lines = reader.lines();
    let header = match lines.next() {
        Some(line) => line.with_context(|| format!("read header of {}", path.display()))?,
        None => String::new(),
    };
    let lines = lines
        .enumerate()
        .map(|(i, line)| line.with_context(|| format!("read line {} in {}", i + 2, path.display())))
        .collect::<Result<Vec<_>>>()?;
    Ok(ShardContents { header, lines })
}

/// Streaming count of `(header present, data lines)` that decodes the file
/// to the very end, so a truncated compressed stream surfaces as an error.
///
/// # Errors
/// Returns an error if the file cannot be opened or fails to decode.
pub fn count_lines(path: &Path) -> Result<(bool, u64)> {
    let mut reader = open_shard(path)?;
    let mut buf = Vec::with_capacity(1024);
    let mut total = 0u64;
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("decode {}", path.display()))?;
        if n == 0 {
            break;
        }
        total += 1;
    }
    Ok((total > 0, total.saturating_sub(1)))
}
