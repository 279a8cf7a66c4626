//! Configuration structures for Betula.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default target node capacity, measured in pivots plus buffered messages.
pub const DEFAULT_MAX_NODE_SIZE: u64 = 64;

/// Tree tunables, supplied at tree construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Target node capacity (pivots + messages).
    pub max_node_size: u64,
    /// Merge threshold for the optional compaction pass.
    pub min_node_size: u64,
    /// Minimum batch size to flush to an out-of-cache child. Half of this
    /// suffices for a child that is already resident in memory.
    pub min_flush_size: u64,
    /// Enable the adaptive epsilon controller.
    pub is_dynamic: bool,
    /// Initial epsilon for new nodes, in (0, 1).
    pub starting_epsilon: f32,
    /// Deepest level at which read/write statistics are collected.
    pub tunable_epsilon_level: u64,
    /// Operations per node between epsilon recomputations.
    pub ops_before_update: u64,
    /// Size of the sliding statistics window.
    pub window_size: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self::with_max_node_size(DEFAULT_MAX_NODE_SIZE)
    }
}

impl TreeConfig {
    /// Creates a config for the given node capacity, deriving the merge
    /// threshold (max/4) and flush floor (max/16) from it.
    pub fn with_max_node_size(max_node_size: u64) -> Self {
        Self {
            max_node_size,
            min_node_size: max_node_size / 4,
            min_flush_size: max_node_size / 16,
            is_dynamic: false,
            starting_epsilon: 0.4,
            tunable_epsilon_level: 0,
            ops_before_update: 100,
            window_size: 100,
        }
    }

    /// Enables the adaptive epsilon controller down to the given level.
    pub fn dynamic(mut self, tunable_epsilon_level: u64) -> Self {
        self.is_dynamic = true;
        self.tunable_epsilon_level = tunable_epsilon_level;
        self
    }
}

/// Configuration for the swap space backing a tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapConfig {
    /// Directory for node object files and tree metadata.
    pub data_dir: PathBuf,
    /// Soft bound on the number of nodes resident in memory.
    pub cache_capacity: usize,
    /// Enable fsync after object writes.
    pub fsync_enabled: bool,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./betula"),
            cache_capacity: 1024,
            fsync_enabled: true,
        }
    }
}

impl SwapConfig {
    /// Creates a config rooted at the given directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Sets the resident-node soft bound.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Enables or disables fsync after object writes.
    pub fn fsync(mut self, enabled: bool) -> Self {
        self.fsync_enabled = enabled;
        self
    }
}
