//! Write-optimized B-epsilon tree index.
//!
//! A B-epsilon tree is a search tree whose internal nodes reserve part of
//! their bounded capacity for a message buffer, so that point writes are
//! batched and flushed lazily toward the leaves. This crate provides:
//!
//! - The node engine: apply/flush/split/merge/adopt/query over buffered
//!   Insert/Delete/Update messages
//! - An adaptive epsilon controller retuning each node's pivot/buffer
//!   split from a sliding window of read/write statistics
//! - The [`Betree`] facade: ordered map API, root promotion, persistence
//! - Lazy ordered iteration folding messages into live records
//!
//! Most of the tree lives on disk through the `betula-swap` paging layer;
//! nodes are paged in on demand and written back on eviction.
//!
//! ```no_run
//! use betula_common::{SwapConfig, TreeConfig};
//! use betula_tree::Betree;
//!
//! # fn main() -> betula_common::Result<()> {
//! let mut tree: Betree<u64, String> =
//!     Betree::open(SwapConfig::new("./db"), TreeConfig::default())?;
//! tree.insert(1, "a".to_string())?;
//! tree.update(1, "b".to_string())?;
//! assert_eq!(tree.query(&1)?, "ab");
//! # Ok(())
//! # }
//! ```

mod codec;
mod iter;
mod message;
mod meta;
mod node;
mod tree;
mod wst;

pub use iter::Scan;
pub use message::{Accumulate, Message, MessageKey};
pub use node::ChildInfo;
pub use tree::{Betree, TreeStats};
pub use wst::{WindowStatTracker, READ_HEAVY_EPSILON, WRITE_HEAVY_EPSILON};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Bounds required of user key types: ordered, cloneable, and
/// serializable so pivot maps and message keys round-trip through the
/// paging layer.
pub trait TreeKey: Ord + Clone + Debug + Serialize + DeserializeOwned {}
impl<T: Ord + Clone + Debug + Serialize + DeserializeOwned> TreeKey for T {}

/// Bounds required of user value types: cloneable, serializable, and
/// accumulable so deferred updates can be folded.
pub trait TreeValue: Clone + Debug + Serialize + DeserializeOwned + Accumulate {}
impl<T: Clone + Debug + Serialize + DeserializeOwned + Accumulate> TreeValue for T {}
