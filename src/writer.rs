//! The shard writer: the only component that mutates output files.
//!
//! Open shards are held in an [`LruCache`] capped at `max_handles`. Each live
//! entry owns a compressing encoder on the key's temp artifact plus an
//! in-memory buffer that is pushed to the encoder in one write once it
//! reaches `buffer_bytes`.
//!
//! Per key the lifecycle is `unopened -> open -> finalized`:
//! - opening creates (or appends to) `.tmp.{pid}.{name}` and writes the
//!   header only when the artifact is new or empty;
//! - finalizing flushes, finishes the compressed stream, then either deletes
//!   the artifact (no data lines) or renames it onto the final name;
//! - a key finalized by eviction and seen again later in the same run is
//!   moved back under its temp name and appended to as a new compressed
//!   member, so the header is still written once.
//!
//! The writer is single threaded by construction (the cache is `!Send`), so
//! no locking is involved.

use crate::error::SplitError;
use crate::io::compression::{FinishWrite, shard_encoder};
use crate::lru::LruCache;
use crate::naming::{ShardNaming, temp_owner};
use crate::processor::KeyBatch;
use anyhow::{Context, Result, anyhow, bail};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

/// Knobs of the shard writer.
#[derive(Clone, Copy, Debug)]
pub struct WriterOptions {
    /// Maximum number of simultaneously open shard handles.
    pub max_handles: usize,
    /// Per-key buffer size that triggers a write to the encoder.
    pub buffer_bytes: usize,
    /// Codec level for shard encoders (gzip 0-9, zstd 1-22).
    pub compression_level: u32,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            max_handles: 1000,
            buffer_bytes: 256 * 1024,
            compression_level: 1,
        }
    }
}

/// Snapshot of writer counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Keys that received at least one data line this run.
    pub keys: usize,
    pub lines: u64,
    pub open_handles: usize,
    pub peak_open_handles: usize,
    pub finalized: u64,
    pub evictions: u64,
    pub reopened: u64,
}

struct HandleEntry {
    encoder: Box<dyn FinishWrite>,
    buffer: Vec<u8>,
}

/// File-level state, kept apart from the cache so the eviction hook can
/// borrow it while the cache is borrowed.
struct ShardFiles {
    dir: PathBuf,
    naming: ShardNaming,
    pid: u32,
    level: u32,
    header: Vec<u8>,
    line_counts: HashMap<String, u64>,
    /// Keys whose shard currently sits under its final name from this run.
    promoted: HashSet<String>,
    finalized: u64,
    evictions: u64,
    reopened: u64,
}

impl ShardFiles {
    fn temp_path(&self, key: &str) -> PathBuf {
        self.naming.temp_path(&self.dir, key, self.pid)
    }

    fn open(&mut self, key: &str) -> Result<HandleEntry> {
        let temp = self.temp_path(key);
        if self.promoted.remove(key) {
            let final_path = self.naming.final_path(&self.dir, key);
            fs::rename(&final_path, &temp).map_err(|e| SplitError::shard_write(key, &final_path, e))?;
            self.reopened += 1;
            debug!(key, "reopened finalized shard");
        }

        let existing = fs::metadata(&temp).map(|m| m.len()).unwrap_or(0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&temp)
            .map_err(|e| SplitError::shard_write(key, &temp, e))?;
        let mut encoder = shard_encoder(file, &temp, self.level)?;
        if existing == 0 {
            encoder
                .write_all(&self.header)
                .and_then(|()| encoder.write_all(b"\n"))
                .map_err(|e| SplitError::shard_write(key, &temp, e))?;
        }
        Ok(HandleEntry {
            encoder,
            buffer: Vec::new(),
        })
    }

    fn flush(&self, key: &str, entry: &mut HandleEntry) -> Result<()> {
        if entry.buffer.is_empty() {
            return Ok(());
        }
        entry
            .encoder
            .write_all(&entry.buffer)
            .map_err(|e| SplitError::shard_write(key, self.temp_path(key), e))?;
        entry.buffer.clear();
        Ok(())
    }

    fn finalize(&mut self, key: &str, mut entry: HandleEntry) -> Result<()> {
        let temp = self.temp_path(key);
        self.flush(key, &mut entry)?;
        entry
            .encoder
            .finish()
            .map_err(|e| SplitError::shard_write(key, &temp, e))?;

        if self.line_counts.get(key).copied().unwrap_or(0) == 0 {
            fs::remove_file(&temp).map_err(|e| SplitError::shard_write(key, &temp, e))?;
            debug!(key, "removed empty shard artifact");
            return Ok(());
        }
        let final_path = self.naming.final_path(&self.dir, key);
        fs::rename(&temp, &final_path).map_err(|e| SplitError::shard_write(key, &final_path, e))?;
        self.promoted.insert(key.to_string());
        self.finalized += 1;
        Ok(())
    }
}

pub struct ShardWriter {
    opts: WriterOptions,
    skip: Arc<HashSet<String>>,
    cache: LruCache<String, HandleEntry>,
    files: ShardFiles,
    peak_open: usize,
}

impl ShardWriter {
    /// Create a writer over `dir`, purging temp artifacts left behind by
    /// processes that are no longer running.
    ///
    /// `header` is the input header line without its terminator. Keys in
    /// `skip` are complete from an earlier run and are never reopened.
    ///
    /// # Errors
    /// Returns an error if the output directory cannot be created or scanned.
    pub fn new(
        dir: impl AsRef<Path>,
        naming: ShardNaming,
        header: &[u8],
        opts: WriterOptions,
        skip: Arc<HashSet<String>>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("mkdir -p {}", dir.display()))?;
        let pid = std::process::id();
        let report = purge_stale_temps(&dir, &naming, Some(pid))?;
        if report.removed > 0 {
            info!(removed = report.removed, kept = report.kept_live, "purged stale temp artifacts");
        }
        if opts.max_handles == 0 {
            bail!(SplitError::InvalidConfig("max_handles must be positive".into()));
        }

        Ok(Self {
            opts,
            skip,
            cache: LruCache::new(opts.max_handles),
            files: ShardFiles {
                dir,
                naming,
                pid,
                level: opts.compression_level,
                header: header.to_vec(),
                line_counts: HashMap::new(),
                promoted: HashSet::new(),
                finalized: 0,
                evictions: 0,
                reopened: 0,
            },
            peak_open: 0,
        })
    }

    /// Make sure `key` has a live handle, evicting the least recently used
    /// shard first when the cache is full.
    ///
    /// # Errors
    /// Fails for keys that are already complete, or on any I/O error while
    /// finalizing the evicted shard or opening the new one.
    pub fn get_or_open(&mut self, key: &str) -> Result<()> {
        let owned = key.to_string();
        if self.cache.get_mut(&owned).is_some() {
            return Ok(());
        }
        if self.skip.contains(key) {
            bail!("shard for key `{key}` is already complete and must not be reopened");
        }

        let files = &mut self.files;
        self.cache.make_room_with(|k, e| {
            files.evictions += 1;
            files.finalize(&k, e)
        })?;
        let entry = files.open(key)?;
        self.cache.insert_with(owned, entry, |k, e| {
            files.evictions += 1;
            files.finalize(&k, e)
        })?;
        self.peak_open = self.peak_open.max(self.cache.len());
        Ok(())
    }

    /// Append a key's batch of lines; flushes the key's buffer to its encoder
    /// once it reaches the size threshold.
    ///
    /// # Errors
    /// See [`ShardWriter::get_or_open`]; also fails when the flush fails.
    pub fn write(&mut self, key: &str, batch: &KeyBatch) -> Result<()> {
        if batch.lines == 0 {
            return Ok(());
        }
        self.get_or_open(key)?;
        let entry = self
            .cache
            .peek_mut(&key.to_string())
            .ok_or_else(|| anyhow!("shard handle for `{key}` vanished after open"))?;
        entry.buffer.extend_from_slice(&batch.bytes);
        *self.files.line_counts.entry(key.to_string()).or_insert(0) += batch.lines;
        if entry.buffer.len() >= self.opts.buffer_bytes {
            self.files.flush(key, entry)?;
        }
        Ok(())
    }

    /// Flush, close and promote one key's shard (or delete it when empty).
    /// A key without a live handle is a no-op.
    ///
    /// # Errors
    /// Returns [`SplitError::ShardWrite`] on I/O failure.
    pub fn finalize(&mut self, key: &str) -> Result<()> {
        match self.cache.remove(&key.to_string()) {
            Some(entry) => self.files.finalize(key, entry),
            None => Ok(()),
        }
    }

    /// Push every buffer into its encoder.
    ///
    /// # Errors
    /// Returns the first flush failure.
    pub fn flush_all(&mut self) -> Result<()> {
        let files = &self.files;
        for (key, entry) in self.cache.values_mut() {
            files.flush(key, entry)?;
        }
        Ok(())
    }

    /// Finalize every live shard, then delete any temp artifact of this
    /// process that is still lying around.
    ///
    /// Best effort: every entry is attempted even after a failure; the first
    /// error is returned.
    ///
    /// # Errors
    /// Returns the first finalize error encountered.
    pub fn close_all(&mut self) -> Result<()> {
        let mut first_err: Option<anyhow::Error> = None;
        while let Some((key, entry)) = self.cache.pop_lru() {
            if let Err(err) = self.files.finalize(&key, entry) {
                warn!(key = %key, error = %format!("{err:#}"), "failed to finalize shard");
                first_err.get_or_insert(err);
            }
        }

        let leftovers = own_temp_artifacts(&self.files.dir, &self.files.naming, self.files.pid)?;
        for path in leftovers {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed leftover temp artifact"),
                Err(err) => warn!(path = %path.display(), error = %err, "could not remove temp artifact"),
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> WriterStats {
        WriterStats {
            keys: self.files.line_counts.values().filter(|n| **n > 0).count(),
            lines: self.files.line_counts.values().sum(),
            open_handles: self.cache.len(),
            peak_open_handles: self.peak_open,
            finalized: self.files.finalized,
            evictions: self.files.evictions,
            reopened: self.files.reopened,
        }
    }

    /// Keys that received data in this run.
    pub fn written_keys(&self) -> impl Iterator<Item = &str> {
        self.files
            .line_counts
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(k, _)| k.as_str())
    }

    /// Keys whose shard currently sits under its final name.
    pub fn finalized_keys(&self) -> impl Iterator<Item = &str> {
        self.files.promoted.iter().map(String::as_str)
    }

    /// Lines routed to `key` so far in this run.
    #[must_use]
    pub fn line_count(&self, key: &str) -> u64 {
        self.files.line_counts.get(key).copied().unwrap_or(0)
    }

    /// Whether `key` currently holds an open handle.
    #[must_use]
    pub fn is_open(&self, key: &str) -> bool {
        self.cache.contains(&key.to_string())
    }
}

/// Outcome of [`purge_stale_temps`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: usize,
    pub kept_live: usize,
}

/// Delete temp artifacts whose owning process is gone.
///
/// Artifacts with an unreadable pid are deleted. Artifacts owned by a live
/// process are kept, except those owned by `own_pid`: a writer being created
/// cannot have legitimate artifacts yet, so those are orphans of an earlier
/// writer in this process (or of a dead process whose pid was reused).
///
/// # Errors
/// Returns an error if the directory listing fails.
pub fn purge_stale_temps(dir: &Path, naming: &ShardNaming, own_pid: Option<u32>) -> Result<PurgeReport> {
    let mut report = PurgeReport::default();
    let mut system = System::new();
    for path in glob_paths(&naming.temp_glob(dir))? {
        let Some(owner) = path.file_name().and_then(|n| n.to_str()).and_then(temp_owner) else {
            continue;
        };
        let stale = match owner {
            None => true,
            Some(pid) if Some(pid) == own_pid => true,
            Some(pid) => !process_alive(&mut system, pid),
        };
        if !stale {
            report.kept_live += 1;
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => report.removed += 1,
            Err(err) => warn!(path = %path.display(), error = %err, "could not remove stale temp artifact"),
        }
    }
    Ok(report)
}

fn own_temp_artifacts(dir: &Path, naming: &ShardNaming, pid: u32) -> Result<Vec<PathBuf>> {
    Ok(glob_paths(&naming.temp_glob(dir))?
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .and_then(temp_owner)
                .flatten()
                == Some(pid)
        })
        .collect())
}

pub(crate) fn glob_paths(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut opts = glob::MatchOptions::new();
    opts.require_literal_leading_dot = false;
    Ok(glob::glob_with(pattern, opts)
        .with_context(|| format!("invalid glob pattern {pattern}"))?
        .filter_map(Result::ok)
        .collect())
}

/// Whether `pid` is in the process table, refreshing just that entry.
fn process_alive(system: &mut System, pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}
