//! End-of-run accounting.
//!
//! A [`RunSummary`] is produced for every run, including aborted ones, and
//! can be logged or saved as JSON next to the shards.
//!
//! Conservation: with [`InvalidPolicy::Drop`](crate::key::InvalidPolicy),
//! `records_read == lines_routed + lines_skipped + invalid_records`. With a
//! catch-all bucket (`catch_all`) the invalid records are part of
//! `lines_routed`.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// How a run ended.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    #[default]
    Completed,
    /// The input ended before the requested start offset.
    ShortInput,
    Interrupted,
    Failed(String),
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    /// Decompression strategy in use, e.g. `external (pigz)`.
    pub strategy: String,
    pub invalid_policy: String,
    /// Invalid records are routed to a catch-all bucket rather than dropped.
    pub catch_all: bool,
    /// Records discarded by fast-forward.
    pub fast_forwarded: u64,
    /// Requested start offset minus the records actually present.
    pub shortfall: u64,
    /// Data records read after fast-forward.
    pub records_read: u64,
    pub lines_routed: u64,
    /// Records of keys that were already complete.
    pub lines_skipped: u64,
    pub invalid_records: u64,
    /// Lines that reached the shard writer.
    pub lines_written: u64,
    pub keys_written: usize,
    pub shards_finalized: u64,
    /// Keys already complete before the run.
    pub keys_preexisting: usize,
    /// Incomplete shards removed by the resume scan.
    pub shards_repaired: usize,
    pub chunks: u64,
    pub evictions: u64,
    pub peak_open_handles: usize,
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
    pub progress_saved: bool,
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl RunSummary {
    /// Records per second over the whole run (reading, skipping, writing).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.records_read + self.fast_forwarded) as f64 / secs
        } else {
            0.0
        }
    }

    /// Whether every record read is accounted for.
    #[must_use]
    pub fn is_conserved(&self) -> bool {
        if self.catch_all {
            self.records_read == self.lines_routed + self.lines_skipped
        } else {
            self.records_read == self.lines_routed + self.lines_skipped + self.invalid_records
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut v {
            map.insert("throughput_lines_per_sec".to_string(), json!(self.throughput()));
        }
        v
    }

    /// Log the summary at `info` (or `warn` when the run did not complete).
    pub fn log(&self) {
        let elapsed = self.elapsed.as_secs_f64();
        info!("==================== split summary ====================");
        info!(outcome = ?self.outcome, strategy = %self.strategy, "run finished");
        info!(
            read = self.records_read,
            routed = self.lines_routed,
            skipped = self.lines_skipped,
            invalid = self.invalid_records,
            policy = %self.invalid_policy,
            "lines"
        );
        info!(
            keys = self.keys_written,
            finalized = self.shards_finalized,
            preexisting = self.keys_preexisting,
            repaired = self.shards_repaired,
            "shards"
        );
        info!(
            elapsed = %format_args!("{:.1} min", elapsed / 60.0),
            throughput = %format_args!("{:.2}M lines/s", self.throughput() / 1e6),
            peak_open_handles = self.peak_open_handles,
            "timing"
        );
        if self.fast_forwarded > 0 || self.shortfall > 0 {
            info!(fast_forwarded = self.fast_forwarded, shortfall = self.shortfall, "fast-forward");
        }
        match (&self.outcome, self.progress_saved) {
            (RunOutcome::Completed, _) => {}
            (_, true) => warn!("progress was saved; rerun with the same output directory to resume"),
            (_, false) => warn!("progress file not written; finished shards on disk still make the run resumable"),
        }
    }

    /// Save the summary as pretty JSON.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or written to.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        file.write_all(formatted.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}
