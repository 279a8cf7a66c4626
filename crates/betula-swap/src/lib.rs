//! Paging layer for Betula.
//!
//! This crate provides:
//! - Object store for node-level file I/O
//! - Swap space managing which nodes are resident in memory, with
//!   pin/dirty tracking and write-back of dirty nodes on eviction

pub mod space;
pub mod store;

pub use space::{recommended_capacity, ObjectCodec, SwapSpace, SwapStats};
pub use store::ObjectStore;
