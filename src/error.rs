//! Fatal failure classes of a split run.
//!
//! Most of the crate returns [`anyhow::Result`] with context attached at each
//! layer. The variants below are the failures that terminate a run; they are
//! wrapped into `anyhow::Error` where they originate, so callers can recover
//! the class with `err.downcast_ref::<SplitError>()`.
//!
//! Per-record problems (malformed lines) and per-shard integrity problems
//! found during resume are not errors: they are counted or repaired.

use std::path::PathBuf;
use std::process::ExitStatus;

#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    /// The external decompressor exited abnormally after data was delivered.
    #[error("external decompressor `{program}` failed: {status}")]
    Decompression { program: String, status: ExitStatus },

    /// A worker failed or panicked while grouping a chunk.
    #[error("processing chunk #{chunk} failed: {message}")]
    ChunkProcessing { chunk: u64, message: String },

    /// Flushing, opening or promoting a shard failed.
    #[error("writing shard for key `{key}` at {} failed", path.display())]
    ShardWrite {
        key: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The input does not even contain a header line.
    #[error("input {} is empty (no header line)", .0.display())]
    EmptyInput(PathBuf),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The run was cancelled (SIGINT/SIGTERM or an explicit cancel).
    #[error("run interrupted")]
    Interrupted,
}

impl SplitError {
    pub(crate) fn shard_write(key: &str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ShardWrite {
            key: key.to_string(),
            path: path.into(),
            source,
        }
    }
}
