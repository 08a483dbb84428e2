pub mod compression;
pub mod shard;
pub mod source;
