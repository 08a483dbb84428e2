//! # Ironshard
//!
//! A **dataset splitter**: repartitions one large, compressed, line-oriented
//! file into one compressed shard per partition key, in a single streaming
//! pass over the input.
//!
//! ## Key Features
//!
//! - **Parallel grouping** - fixed-size chunks of lines are grouped by key on a worker pool
//! - **Bounded file handles** - an LRU cache keeps at most `max_handles` shards open
//! - **Crash-safe shards** - shards are written under a process-owned temp name and renamed when finished
//! - **Resumable** - complete shards are detected on restart and their keys skipped
//! - **Fast-forward** - skip a known number of leading records with `start_offset`
//! - **Progress sidecar** - a JSON file recording completed keys and records routed
//! - **External decompression** - pigz (or any `-dc` style tool) with an in-process fallback
//!
//! ## Quick Start
//!
//! ```no_run
//! use ironshard::{Runner, SplitConfig};
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let config = SplitConfig {
//!     input: "protein.links.full.txt.gz".into(),
//!     output_dir: "cache/string".into(),
//!     workers: 8,
//!     ..Default::default()
//! };
//!
//! let summary = Runner::new(config).run()?;
//! println!("{} lines into {} shards", summary.lines_written, summary.keys_written);
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Keys
//!
//! A [`KeyExtractor`] derives the partition key from a record. The default
//! [`FieldPrefixExtractor`] takes the first whitespace-separated field and
//! keeps the part before its first `.` (`"9606.ENSP0001 9606.ENSP0002 700"`
//! belongs to key `9606`). Records without a usable key are dropped or routed
//! to a catch-all bucket, see [`InvalidPolicy`].
//!
//! ### Shards
//!
//! Each key gets one file, named from the hash of a name template plus the key
//! (see [`ShardNaming`]). Every shard starts with the input's header line. A
//! shard is complete when it decompresses cleanly and holds the header and at
//! least one data line.
//!
//! ### Resume
//!
//! On start, complete shards are kept and their keys skipped, incomplete ones
//! are deleted, and temp files of dead processes are purged. Running twice
//! with the same inputs yields the same shards.
//!
//! ## Architecture
//!
//! One reader thread decompresses and cuts chunks, a rayon pool groups them,
//! and the calling thread is the single owner of the [`ShardWriter`]. See
//! [`runner`] for the topology.
//!
//! ## Module Overview
//!
//! - [`config`] - run configuration
//! - [`io`] - codecs, the chunked input source and shard readers
//! - [`key`] / [`naming`] - key extraction and shard file names
//! - [`processor`] - per-chunk grouping
//! - [`lru`] / [`writer`] - handle cache and shard writer
//! - [`resume`] / [`checkpoint`] - restart scan and progress sidecar
//! - [`metrics`] - run summary
//! - [`testing`] - fixtures for tests of split runs

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod io;
pub mod key;
pub mod lru;
pub mod metrics;
pub mod naming;
pub mod processor;
pub mod resume;
pub mod runner;
pub mod testing;
pub mod writer;

pub use checkpoint::{ProgressPolicy, ProgressRecord, ProgressRecorder};
pub use config::SplitConfig;
pub use error::SplitError;
pub use io::source::{ChunkSource, Decompressor, ExternalDecompressor};
pub use key::{Delimiter, ExtractedKey, FieldPrefixExtractor, InvalidPolicy, KeyExtractor};
pub use metrics::{RunOutcome, RunSummary};
pub use naming::{NameHash, ShardNaming};
pub use runner::{CancelToken, Runner};
pub use writer::{ShardWriter, WriterOptions, WriterStats};
