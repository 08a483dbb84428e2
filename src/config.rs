//! Run configuration.

use crate::checkpoint::ProgressPolicy;
use crate::error::SplitError;
use crate::io::source::Decompressor;
use crate::key::{InvalidPolicy, is_valid_key};
use crate::naming::ShardNaming;
use crate::writer::WriterOptions;
use std::path::PathBuf;
use std::time::Duration;

/// Everything a split run needs.
///
/// ```
/// use ironshard::config::SplitConfig;
///
/// let config = SplitConfig {
///     input: "protein.links.txt.gz".into(),
///     output_dir: "cache/string".into(),
///     max_handles: 64,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug)]
pub struct SplitConfig {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    /// Size of the chunk processing pool.
    pub workers: usize,
    pub max_handles: usize,
    /// Lines per chunk.
    pub chunk_size: usize,
    /// Skip keys whose shard is already complete on disk.
    pub skip_existing: bool,
    /// Data records to fast-forward past before processing.
    pub start_offset: u64,
    pub decompressor: Decompressor,
    /// Per-key buffer size that triggers a write.
    pub buffer_bytes: usize,
    /// Push every buffer to its encoder after this many chunks.
    pub flush_every_chunks: u64,
    pub compression_level: u32,
    pub naming: ShardNaming,
    pub invalid_policy: InvalidPolicy,
    /// Progress sidecar file name, relative to `output_dir`.
    pub progress_file: String,
    pub progress_policy: ProgressPolicy,
    /// How often the consumer logs a progress line.
    pub log_interval: Duration,
}

impl Default for SplitConfig {
    fn default() -> Self {
        let writer = WriterOptions::default();
        Self {
            input: PathBuf::new(),
            output_dir: PathBuf::from("."),
            workers: num_cpus::get().max(1),
            max_handles: writer.max_handles,
            chunk_size: 1_000_000,
            skip_existing: true,
            start_offset: 0,
            decompressor: Decompressor::default(),
            buffer_bytes: writer.buffer_bytes,
            flush_every_chunks: 10,
            compression_level: writer.compression_level,
            naming: ShardNaming::default(),
            invalid_policy: InvalidPolicy::Drop,
            progress_file: "split_progress.json".to_string(),
            progress_policy: ProgressPolicy::TimeInterval(300),
            log_interval: Duration::from_secs(30),
        }
    }
}

impl SplitConfig {
    /// Check values that would otherwise fail deep inside the pipeline.
    ///
    /// # Errors
    /// Returns [`SplitError::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<(), SplitError> {
        let bad = |msg: &str| Err(SplitError::InvalidConfig(msg.to_string()));
        if self.workers == 0 {
            return bad("workers must be positive");
        }
        if self.max_handles == 0 {
            return bad("max_handles must be positive");
        }
        if self.chunk_size == 0 {
            return bad("chunk_size must be positive");
        }
        if self.buffer_bytes == 0 {
            return bad("buffer_bytes must be positive");
        }
        if self.naming.suffix.is_empty() || self.naming.suffix.contains('/') {
            return bad("shard suffix must be a non-empty file name suffix");
        }
        if self.progress_file.is_empty() || self.progress_file.contains('/') {
            return bad("progress file must be a plain file name");
        }
        if let InvalidPolicy::CatchAll(bucket) = &self.invalid_policy
            && !is_valid_key(bucket)
        {
            return bad("catch-all bucket must be a valid key");
        }
        Ok(())
    }

    #[must_use]
    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            max_handles: self.max_handles,
            buffer_bytes: self.buffer_bytes,
            compression_level: self.compression_level,
        }
    }

    #[must_use]
    pub fn progress_path(&self) -> PathBuf {
        self.output_dir.join(&self.progress_file)
    }

    /// Chunks allowed in flight between the reader and the consumer.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.workers.saturating_mul(2).max(2)
    }
}
