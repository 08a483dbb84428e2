//! Deterministic shard file names.
//!
//! A shard for key `k` is called `{hash}-{k}{suffix}`, where `hash` is 32 hex
//! digits of a digest over the name template with `{key}` replaced by `k`:
//! truncated SHA-256 by default, or the full MD5 for readers that derive
//! cache file names as `md5(url)`. Repeated runs (and the downstream readers
//! that look the shards up) therefore agree on the file name without any
//! index.
//!
//! While a shard is being written it lives under a temp name owned by the
//! writing process: `.tmp.{pid}.{final name}`.

use md5::Md5;
use sha2::Sha256;
use std::path::{Path, PathBuf};

const TEMP_PREFIX: &str = ".tmp.";
const HASH_LEN: usize = 32;

/// Digest behind the hash component of shard names.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NameHash {
    #[default]
    Sha256,
    Md5,
}

impl NameHash {
    fn hex(self, input: &[u8]) -> String {
        let hex = match self {
            Self::Sha256 => format!("{:x}", <Sha256 as sha2::Digest>::digest(input)),
            Self::Md5 => format!("{:x}", <Md5 as md5::Digest>::digest(input)),
        };
        hex[..HASH_LEN].to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardNaming {
    /// Hashed to produce the stable file name prefix; `{key}` is substituted.
    pub template: String,
    /// File name suffix, including the codec extension (e.g. `.txt.gz`).
    pub suffix: String,
    pub algorithm: NameHash,
}

impl Default for ShardNaming {
    fn default() -> Self {
        Self {
            template: "{key}".to_string(),
            suffix: ".txt.gz".to_string(),
            algorithm: NameHash::Sha256,
        }
    }
}

impl ShardNaming {
    #[must_use]
    pub fn new(template: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            suffix: suffix.into(),
            algorithm: NameHash::default(),
        }
    }

    #[must_use]
    pub fn with_algorithm(mut self, algorithm: NameHash) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Stable hash component of the shard name for `key`.
    #[must_use]
    pub fn hash(&self, key: &str) -> String {
        self.algorithm.hex(self.template.replace("{key}", key).as_bytes())
    }

    #[must_use]
    pub fn file_name(&self, key: &str) -> String {
        format!("{}-{}{}", self.hash(key), key, self.suffix)
    }

    #[must_use]
    pub fn final_path(&self, dir: &Path, key: &str) -> PathBuf {
        dir.join(self.file_name(key))
    }

    #[must_use]
    pub fn temp_path(&self, dir: &Path, key: &str, pid: u32) -> PathBuf {
        dir.join(format!("{TEMP_PREFIX}{pid}.{}", self.file_name(key)))
    }

    /// Recover the key from a final shard file name.
    ///
    /// Returns `None` for temp artifacts, foreign files, and names whose hash
    /// does not match the key under this naming scheme.
    #[must_use]
    pub fn parse_final(&self, file_name: &str) -> Option<String> {
        if file_name.starts_with(TEMP_PREFIX) {
            return None;
        }
        let stem = file_name.strip_suffix(self.suffix.as_str())?;
        let (hash, key) = stem.split_once('-')?;
        if hash.len() != HASH_LEN || key.is_empty() || self.hash(key) != hash {
            return None;
        }
        Some(key.to_string())
    }

    /// Glob pattern matching every final shard under `dir`.
    #[must_use]
    pub fn final_glob(&self, dir: &Path) -> String {
        format!("{}/*-*{}", glob::Pattern::escape(&dir.to_string_lossy()), glob::Pattern::escape(&self.suffix))
    }

    /// Glob pattern matching every temp artifact under `dir`, whatever the pid.
    #[must_use]
    pub fn temp_glob(&self, dir: &Path) -> String {
        format!(
            "{}/{}*{}",
            glob::Pattern::escape(&dir.to_string_lossy()),
            TEMP_PREFIX,
            glob::Pattern::escape(&self.suffix)
        )
    }

    /// Lookup used by downstream readers: the final shard for `key`, if it
    /// exists.
    #[must_use]
    pub fn locate(&self, dir: &Path, key: &str) -> Option<PathBuf> {
        let path = self.final_path(dir, key);
        path.is_file().then_some(path)
    }
}

/// Owner pid of a temp artifact name.
///
/// `Some(None)` means "temp artifact, but the pid segment is unreadable".
#[must_use]
pub fn temp_owner(file_name: &str) -> Option<Option<u32>> {
    let rest = file_name.strip_prefix(TEMP_PREFIX)?;
    let pid = rest.split_once('.').and_then(|(pid, _)| pid.parse::<u32>().ok());
    Some(pid)
}
