//! Classification of shards left by earlier runs.
//!
//! Every existing file that follows the naming scheme is read through
//! completely: it counts as complete only if it decodes cleanly to the end,
//! has a header line, and has at least one data line. Anything else is
//! deleted so the key gets reprocessed.
//!
//! The shard files are the ground truth. The progress file is advisory and
//! is corrected to match them (see [`reconcile`]).

use crate::checkpoint::ProgressRecord;
use crate::io::shard::count_lines;
use crate::naming::ShardNaming;
use crate::writer::glob_paths;
use anyhow::Result;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Verdict of the full-read integrity check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardCheck {
    Complete { data_lines: u64 },
    MissingHeader,
    NoDataLines,
    Corrupt,
}

impl ShardCheck {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, ShardCheck::Complete { .. })
    }
}

/// Read `path` to the end and classify it.
#[must_use]
pub fn check_shard(path: &Path) -> ShardCheck {
    match count_lines(path) {
        Ok((false, _)) => ShardCheck::MissingHeader,
        Ok((true, 0)) => ShardCheck::NoDataLines,
        Ok((true, data_lines)) => ShardCheck::Complete { data_lines },
        Err(err) => {
            debug!(path = %path.display(), error = %format!("{err:#}"), "shard failed to decode");
            ShardCheck::Corrupt
        }
    }
}

/// Immutable snapshot handed to the pipeline before it starts.
#[derive(Clone, Debug, Default)]
pub struct ResumeState {
    /// Keys whose shard is complete; their records are skipped.
    pub complete: HashSet<String>,
    /// Incomplete shards that were deleted.
    pub removed: Vec<PathBuf>,
    /// Data lines held by the complete shards.
    pub complete_lines: u64,
}

/// Scan `dir` for existing shards, keep the complete ones and delete the
/// rest.
///
/// # Errors
/// Returns an error if the directory cannot be listed.
pub fn scan_existing(dir: &Path, naming: &ShardNaming) -> Result<ResumeState> {
    let mut state = ResumeState::default();
    if !dir.exists() {
        return Ok(state);
    }

    for path in glob_paths(&naming.final_glob(dir))? {
        let Some(key) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| naming.parse_final(n))
        else {
            continue;
        };

        match check_shard(&path) {
            ShardCheck::Complete { data_lines } => {
                state.complete_lines += data_lines;
                state.complete.insert(key);
            }
            verdict => {
                match fs::remove_file(&path) {
                    Ok(()) => warn!(path = %path.display(), ?verdict, "removed incomplete shard"),
                    Err(err) => warn!(path = %path.display(), ?verdict, error = %err, "could not remove incomplete shard"),
                }
                state.removed.push(path);
            }
        }
    }

    info!(
        complete = state.complete.len(),
        removed = state.removed.len(),
        "scanned existing shards"
    );
    Ok(state)
}

/// Make the progress record agree with the shards on disk.
///
/// Keys recorded as completed whose shard is missing or was just deleted are
/// dropped from the record. Returns the dropped keys.
pub fn reconcile(progress: &mut ProgressRecord, state: &ResumeState) -> Vec<String> {
    let mut dropped: Vec<String> = progress
        .completed_keys
        .iter()
        .filter(|k| !state.complete.contains(*k))
        .cloned()
        .collect();
    dropped.sort();
    if !dropped.is_empty() {
        progress.completed_keys.retain(|k| state.complete.contains(k));
        warn!(
            dropped = dropped.len(),
            "progress file lists keys without a complete shard; shards on disk win"
        );
    }
    dropped
}
