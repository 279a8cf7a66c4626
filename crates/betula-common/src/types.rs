//! Identifier types for Betula nodes.

use serde::{Deserialize, Serialize};

/// Unique identifier for a tree node.
///
/// Node ids are handed out by the swap space from a monotone counter and
/// are stable for the lifetime of a node. The id doubles as the name of
/// the node's backing object on disk.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Sentinel for a node that has not been registered with the swap space.
    pub const INVALID: NodeId = NodeId(u64::MAX);

    /// Creates a new NodeId.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns true if this id has been assigned by a swap space.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
