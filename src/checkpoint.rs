//! Progress sidecar for resumable split runs.
//!
//! The progress file records which keys have a finished shard, how many
//! records were routed across all runs, and how far into the input the last
//! run got. It is written with write-then-rename, so it is either the old or
//! the new version, never a torn one.
//!
//! The file is advisory: the shards on disk are what decides whether a key is
//! complete. See [`crate::resume::reconcile`].
//!
//! # Usage
//!
//! ```no_run
//! use ironshard::checkpoint::{ProgressPolicy, ProgressRecorder};
//! # fn main() -> anyhow::Result<()> {
//! let mut recorder = ProgressRecorder::open("out/split_progress.json", ProgressPolicy::TimeInterval(300));
//! recorder.update(["9606".to_string()], 1_000, 1_000);
//! recorder.save(true)?;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Persisted progress state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressRecord {
    /// Keys with a finished shard, across all runs.
    pub completed_keys: BTreeSet<String>,
    /// Records routed to shards, across all runs.
    pub total_records: u64,
    /// Input data records consumed by the last run (fast-forwarded ones
    /// included); a candidate `start_offset` for the next run.
    pub records_consumed: u64,
    /// Milliseconds since the Unix epoch at save time.
    pub timestamp: u64,
    /// Whether the last save happened at the normal end of a run.
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl ProgressRecord {
    /// Load a record; a missing file yields an empty record.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parse progress file {}", path.display()))
    }

    /// Merge newly completed keys into the historical set.
    pub fn merge<I: IntoIterator<Item = String>>(&mut self, keys: I) {
        self.completed_keys.extend(keys);
    }

    /// Persist via `{path}.tmp` + fsync + rename.
    ///
    /// # Errors
    /// Returns an error if the temp file cannot be written or renamed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
        }
        let tmp = tmp_path(path);
        let encoded = serde_json::to_vec_pretty(self).context("serialize progress record")?;
        let mut file = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(&encoded)
            .with_context(|| format!("write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("sync {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// When the recorder writes the progress file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressPolicy {
    /// Never persist (dry runs, tests).
    Never,
    /// Only at the end of a run (normal or aborted).
    AtEnd,
    /// At the end, and roughly every N seconds during the run.
    TimeInterval(u64),
}

/// Owns the progress record of one run and decides when to persist it.
pub struct ProgressRecorder {
    path: PathBuf,
    record: ProgressRecord,
    policy: ProgressPolicy,
    /// `total_records` as loaded; this run's count is added on top.
    base_total: u64,
    last_save: Instant,
}

impl ProgressRecorder {
    /// Load the record at `path`. An unreadable file is logged and replaced
    /// by an empty record, since the shards remain authoritative.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>, policy: ProgressPolicy) -> Self {
        let path = path.into();
        let record = ProgressRecord::load(&path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %format!("{err:#}"), "ignoring unreadable progress file");
            ProgressRecord::default()
        });
        Self {
            base_total: record.total_records,
            path,
            record,
            policy,
            last_save: Instant::now(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn record(&self) -> &ProgressRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut ProgressRecord {
        &mut self.record
    }

    #[must_use]
    pub fn policy(&self) -> ProgressPolicy {
        self.policy
    }

    /// Fold this run's state into the record (not yet persisted).
    pub fn update<I: IntoIterator<Item = String>>(&mut self, keys: I, run_records: u64, consumed: u64) {
        self.record.merge(keys);
        self.record.total_records = self.base_total + run_records;
        self.record.records_consumed = consumed;
    }

    /// Whether an interval save is due.
    #[must_use]
    pub fn interval_due(&self) -> bool {
        match self.policy {
            ProgressPolicy::TimeInterval(secs) => self.last_save.elapsed() >= Duration::from_secs(secs),
            ProgressPolicy::Never | ProgressPolicy::AtEnd => false,
        }
    }

    /// Persist the record unless the policy is [`ProgressPolicy::Never`].
    /// Returns whether anything was written.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&mut self, is_final: bool) -> Result<bool> {
        if self.policy == ProgressPolicy::Never {
            return Ok(false);
        }
        self.record.timestamp = current_timestamp_ms();
        self.record.is_final = is_final;
        self.record.save(&self.path)?;
        self.last_save = Instant::now();
        debug!(path = %self.path.display(), keys = self.record.completed_keys.len(), "saved progress");
        Ok(true)
    }
}

/// Get current timestamp in milliseconds since epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
