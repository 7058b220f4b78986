use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for a zerokv instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listen address handed to the external server layer.
    pub addr: String,

    /// Directory holding segment files, the commit log and `DB.CFG`.
    pub dir_path: PathBuf,

    /// Segment rotation threshold in bytes (default: 16MB).
    pub block_size: u64,

    /// Keys larger than this are rejected (default: 1KB).
    pub max_key_size: u32,

    /// Values larger than this are rejected (default: 8KB).
    pub max_value_size: u32,

    /// If true, fsync after every mutation append and after each
    /// commit-log write. If false, a system crash may lose recent writes.
    pub sync: bool,

    /// Minimum archived-segment count (for any type) before a reclaim
    /// pass is allowed (default: 4).
    pub reclaim_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5200".to_string(),
            dir_path: PathBuf::from("/tmp/zerokv"),
            block_size: 16 * 1024 * 1024, // 16MB
            max_key_size: 1024,
            max_value_size: 8 * 1024,
            sync: false,
            reclaim_threshold: 4,
        }
    }
}

impl Config {
    /// Create a new config rooted at the given data directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir_path: dir.into(),
            ..Default::default()
        }
    }

    /// Set the listen address.
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Set the segment rotation threshold.
    pub fn block_size(mut self, size: u64) -> Self {
        self.block_size = size;
        self
    }

    /// Set the maximum key size.
    pub fn max_key_size(mut self, size: u32) -> Self {
        self.max_key_size = size;
        self
    }

    /// Set the maximum value size.
    pub fn max_value_size(mut self, size: u32) -> Self {
        self.max_value_size = size;
        self
    }

    /// Enable fsync-per-write durability.
    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Set the reclaim threshold.
    pub fn reclaim_threshold(mut self, threshold: usize) -> Self {
        self.reclaim_threshold = threshold;
        self
    }
}
