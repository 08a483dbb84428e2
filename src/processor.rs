//! Grouping of one chunk's records by partition key.
//!
//! [`process_chunk`] is pure: it reads the chunk, the immutable skip set and
//! the extractor, and returns an owned [`ChunkOutput`]. That is what makes
//! chunks safe to hand to any worker thread in any order.

use crate::io::source::Chunk;
use crate::key::{ExtractedKey, InvalidPolicy, KeyExtractor};
use std::collections::{HashMap, HashSet};

/// Lines of one key from one chunk, concatenated in input order, each
/// terminated by `\n`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyBatch {
    pub bytes: Vec<u8>,
    pub lines: u64,
}

impl KeyBatch {
    fn push(&mut self, record: &[u8]) {
        self.bytes.extend_from_slice(record);
        self.bytes.push(b'\n');
        self.lines += 1;
    }
}

/// Everything a worker produces for one chunk.
#[derive(Clone, Debug, Default)]
pub struct ChunkOutput {
    pub index: u64,
    /// Records in the chunk.
    pub lines: u64,
    pub grouped: HashMap<String, KeyBatch>,
    /// Records routed to a key (including catch-all routing).
    pub routed: u64,
    /// Records whose key is already complete.
    pub skipped: u64,
    /// Records whose key could not be extracted.
    pub invalid: u64,
}

impl ChunkOutput {
    /// Every record of the chunk is accounted for exactly once, except
    /// invalid records routed to a catch-all bucket, which are both routed
    /// and invalid.
    #[must_use]
    pub fn records(&self, policy: &InvalidPolicy) -> u64 {
        match policy {
            InvalidPolicy::Drop => self.routed + self.skipped + self.invalid,
            InvalidPolicy::CatchAll(_) => self.routed + self.skipped,
        }
    }
}

/// Group a chunk's records by key, counting records of complete keys as
/// skipped and applying `policy` to records without a usable key.
pub fn process_chunk(
    chunk: &Chunk,
    skip: &HashSet<String>,
    extractor: &dyn KeyExtractor,
    policy: &InvalidPolicy,
) -> ChunkOutput {
    let mut out = ChunkOutput {
        index: chunk.index,
        lines: chunk.lines as u64,
        ..Default::default()
    };

    for record in chunk.records() {
        let key = match extractor.extract(record) {
            ExtractedKey::Key(key) => key,
            ExtractedKey::Invalid => {
                out.invalid += 1;
                match policy {
                    InvalidPolicy::Drop => continue,
                    InvalidPolicy::CatchAll(bucket) => bucket.as_str(),
                }
            }
        };

        if skip.contains(key) {
            out.skipped += 1;
            continue;
        }

        if let Some(batch) = out.grouped.get_mut(key) {
            batch.push(record);
        } else {
            let mut batch = KeyBatch::default();
            batch.push(record);
            out.grouped.insert(key.to_string(), batch);
        }
        out.routed += 1;
    }

    out
}
