//! The tree facade: root ownership, timestamps, and the public map API.

use std::path::PathBuf;

use betula_common::{BetulaError, NodeId, Result, SwapConfig, TreeConfig};
use betula_swap::SwapSpace;

use crate::codec::NodeCodec;
use crate::iter::Scan;
use crate::message::{Message, MessageKey};
use crate::meta::{MetaRecord, META_FILE};
use crate::node::{MessageMap, Node, PivotMap};
use crate::{TreeKey, TreeValue};

/// Aggregate statistics over every reachable node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    /// Longest root-to-leaf distance, in edges.
    pub height: u64,
    /// Number of reachable nodes.
    pub node_count: u64,
    /// Total pivot entries.
    pub pivot_count: u64,
    /// Total buffered messages (including materialized leaf state).
    pub message_count: u64,
}

/// A write-optimized external ordered map over a B-epsilon tree.
///
/// The tree owns one reference to the root; every other node is owned by
/// its parent's pivot map and lives in the swap space, which pages nodes
/// to disk as the cache fills. Mutations stamp a monotone tree-scoped
/// timestamp and flush a one-message batch into the root; queries walk
/// root to leaf folding the messages they pass.
pub struct Betree<K: TreeKey, V: TreeValue> {
    pub(crate) swap: SwapSpace<Node<K, V>, NodeCodec<K, V>>,
    pub(crate) config: TreeConfig,
    pub(crate) root: NodeId,
    next_timestamp: u64,
    meta_path: PathBuf,
}

impl<K: TreeKey, V: TreeValue> Betree<K, V> {
    /// Opens a tree over the given directory, resuming from its metadata
    /// record when one exists and starting fresh otherwise.
    pub fn open(swap_config: SwapConfig, config: TreeConfig) -> Result<Self> {
        let codec = NodeCodec::new(config.clone());
        let mut swap = SwapSpace::open(
            &swap_config.data_dir,
            swap_config.cache_capacity,
            swap_config.fsync_enabled,
            codec,
        )?;
        let meta_path = swap_config.data_dir.join(META_FILE);

        if meta_path.exists() {
            let meta = MetaRecord::load(&meta_path)?;
            swap.set_next_id(meta.next_node_id);
            return Ok(Self {
                swap,
                config,
                root: NodeId(meta.root),
                next_timestamp: meta.next_timestamp,
                meta_path,
            });
        }

        let mut root = Node::new(config.starting_epsilon, 0, &config);
        let id = swap.allocate_id();
        root.node_id = id;
        swap.insert(id, root);

        Ok(Self {
            swap,
            config,
            root: id,
            next_timestamp: 1, // Nothing has a timestamp of 0
            meta_path,
        })
    }

    /// Inserts a key-value pair, superseding any previous state.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        self.upsert(key, Message::Insert(value))
    }

    /// Queues a blind update: `value` is folded into the existing state
    /// for the key (or the identity) when a read reaches it.
    pub fn update(&mut self, key: K, value: V) -> Result<()> {
        self.upsert(key, Message::Update(value))
    }

    /// Removes a key.
    pub fn erase(&mut self, key: K) -> Result<()> {
        self.upsert(key, Message::Delete)
    }

    /// Looks up the value for a key. `Err(KeyNotFound)` is the expected
    /// negative result.
    pub fn query(&mut self, key: &K) -> Result<V> {
        self.query_node(self.root, key)
    }

    /// Ordered scan over the live key range.
    pub fn scan<R: std::ops::RangeBounds<K>>(&mut self, range: R) -> Scan<'_, K, V> {
        Scan::new(self, range)
    }

    /// Ordered scan over every live key.
    pub fn iter(&mut self) -> Scan<'_, K, V> {
        self.scan(..)
    }

    /// Writes every dirty node and the tree metadata back to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.swap.flush_all()?;
        let meta = MetaRecord {
            root: self.root.0,
            next_timestamp: self.next_timestamp,
            next_node_id: self.swap.next_id(),
        };
        meta.store(&self.meta_path)
    }

    /// Optional maintenance: greedily merges runs of small children
    /// throughout the tree. Never changes query results.
    pub fn compact(&mut self) -> Result<()> {
        let mut work = vec![self.root];
        while let Some(id) = work.pop() {
            let mut node = self.swap.checkout(id)?;
            let result = node.merge_small_children(self);
            let children = node.child_ids();
            self.swap.checkin(id, node, true);
            result?;

            for child in children {
                if !self.swap.peek(child, |n| n.is_leaf())? {
                    work.push(child);
                }
            }
        }
        Ok(())
    }

    /// Walks every reachable node and aggregates size statistics.
    pub fn stats(&mut self) -> Result<TreeStats> {
        let mut stats = TreeStats {
            height: 0,
            node_count: 0,
            pivot_count: 0,
            message_count: 0,
        };
        let mut work = vec![(self.root, 0u64)];
        while let Some((id, depth)) = work.pop() {
            stats.height = stats.height.max(depth);
            let (pivots, messages, children) = self.swap.peek(id, |node| {
                (
                    node.pivots.len() as u64,
                    node.elements.len() as u64,
                    node.child_ids(),
                )
            })?;
            stats.node_count += 1;
            stats.pivot_count += pivots;
            stats.message_count += messages;
            for child in children {
                work.push((child, depth + 1));
            }
        }
        Ok(stats)
    }

    /// Walks every reachable node and checks the structural invariants:
    /// capacity bounds, pivot coverage, and leaf contents.
    pub fn verify(&mut self) -> Result<()> {
        let mut work: Vec<(NodeId, Option<K>, Option<K>)> = vec![(self.root, None, None)];
        while let Some((id, lower, upper)) = work.pop() {
            let children = self.swap.peek(id, |node| {
                let node_id = node.node_id.0;
                if node.pivots.len() as u64 > node.max_pivots {
                    return Err(BetulaError::NodeCorrupted {
                        node_id,
                        reason: format!(
                            "{} pivots exceed the bound of {}",
                            node.pivots.len(),
                            node.max_pivots
                        ),
                    });
                }
                if node.elements.len() as u64 > node.max_messages {
                    return Err(BetulaError::NodeCorrupted {
                        node_id,
                        reason: format!(
                            "{} messages exceed the bound of {}",
                            node.elements.len(),
                            node.max_messages
                        ),
                    });
                }

                let in_bounds = |key: &K| {
                    lower.as_ref().map(|l| key >= l).unwrap_or(true)
                        && upper.as_ref().map(|u| key < u).unwrap_or(true)
                };
                for key in node.pivots.keys() {
                    if !in_bounds(key) {
                        return Err(BetulaError::NodeCorrupted {
                            node_id,
                            reason: format!("pivot {:?} outside its routed range", key),
                        });
                    }
                }
                for mkey in node.elements.keys() {
                    if !in_bounds(&mkey.key) {
                        return Err(BetulaError::NodeCorrupted {
                            node_id,
                            reason: format!("message {:?} outside its routed range", mkey.key),
                        });
                    }
                }

                if node.is_leaf() {
                    let mut prev: Option<&K> = None;
                    for (mkey, message) in &node.elements {
                        if !matches!(message, Message::Insert(_)) {
                            return Err(BetulaError::NodeCorrupted {
                                node_id,
                                reason: "leaf buffers a non-insert message".to_string(),
                            });
                        }
                        if prev == Some(&mkey.key) {
                            return Err(BetulaError::NodeCorrupted {
                                node_id,
                                reason: format!("leaf holds duplicate key {:?}", mkey.key),
                            });
                        }
                        prev = Some(&mkey.key);
                    }
                }

                let keys: Vec<K> = node.pivots.keys().cloned().collect();
                let mut items = Vec::with_capacity(keys.len());
                for (i, key) in keys.iter().enumerate() {
                    let child = node.pivots[key].child;
                    let child_upper = keys.get(i + 1).cloned().or_else(|| upper.clone());
                    items.push((child, Some(key.clone()), child_upper));
                }
                Ok(items)
            })??;
            work.extend(children);
        }
        Ok(())
    }

    /// Stamps one message and flushes it into the root, promoting a new
    /// root when the old one splits.
    fn upsert(&mut self, key: K, message: Message<V>) -> Result<()> {
        let timestamp = self.next_timestamp;
        self.next_timestamp += 1;

        let mut batch = MessageMap::new();
        batch.insert(MessageKey::new(key, timestamp), message);

        let new_children = self.flush_node(self.root, batch)?;
        if !new_children.is_empty() {
            // The old root was consumed by its split; the new root sits
            // above its siblings, at level 0, keeping their epsilon.
            let first_child = new_children.values().next().expect("non-empty").child;
            let epsilon = self.swap.peek(first_child, |n| n.epsilon)?;

            let mut root = Node::new(epsilon, 0, &self.config);
            root.pivots = new_children;
            let id = self.swap.allocate_id();
            root.node_id = id;
            self.swap.insert(id, root);
            self.root = id;
        }
        Ok(())
    }

    /// Checks a node out, flushes a batch into it, and returns it to the
    /// arena; a node consumed by its own split is freed instead.
    pub(crate) fn flush_node(
        &mut self,
        id: NodeId,
        elts: MessageMap<K, V>,
    ) -> Result<PivotMap<K>> {
        let mut node = self.swap.checkout(id)?;
        let result = node.flush(self, elts);
        let consumed = matches!(&result, Ok(new_children) if !new_children.is_empty());
        if consumed {
            drop(node);
            self.swap.free(id)?;
        } else {
            self.swap.checkin(id, node, true);
        }
        result
    }

    /// Checks a node out, queries through it, and returns it to the
    /// arena, marking it dirty only when the read mutated it (statistics
    /// bookkeeping or adoption).
    pub(crate) fn query_node(&mut self, id: NodeId, key: &K) -> Result<V> {
        let mut node = self.swap.checkout(id)?;
        let touches_stats =
            self.config.is_dynamic && node.level <= self.config.tunable_epsilon_level;
        let adopting = node.adoption_flag;
        let result = node.query(self, key);
        self.swap.checkin(id, node, touches_stats || adopting);
        result
    }

    /// Size of a node in pivots plus messages, paging it in if needed.
    pub(crate) fn node_weight(&mut self, id: NodeId) -> Result<u64> {
        self.swap.peek(id, |node| node.weight())
    }

    /// Lowers a node one level after adoption.
    pub(crate) fn decrement_level(&mut self, id: NodeId) -> Result<()> {
        self.swap.peek_mut(id, |node| {
            node.level = node.level.saturating_sub(1);
        })
    }

    /// Installs a new epsilon and the matching capacities on an entire
    /// subtree, as a work-list traversal.
    pub(crate) fn propagate_epsilon(
        &mut self,
        mut work: Vec<NodeId>,
        epsilon: f32,
        max_pivots: u64,
        max_messages: u64,
    ) -> Result<()> {
        while let Some(id) = work.pop() {
            let children = self.swap.peek_mut(id, |node| {
                node.epsilon = epsilon;
                node.max_pivots = max_pivots;
                node.max_messages = max_messages;
                node.child_ids()
            })?;
            work.extend(children);
        }
        Ok(())
    }

    /// Flags an entire subtree as adoption candidates, as a work-list
    /// traversal.
    pub(crate) fn flag_subtree_for_adoption(&mut self, mut work: Vec<NodeId>) -> Result<()> {
        while let Some(id) = work.pop() {
            let children = self.swap.peek_mut(id, |node| {
                node.adoption_flag = true;
                node.child_ids()
            })?;
            work.extend(children);
        }
        Ok(())
    }

    /// First message in the whole tree strictly after the given message
    /// key, in (key, timestamp) order.
    pub(crate) fn next_message(
        &mut self,
        after: Option<&MessageKey<K>>,
    ) -> Result<Option<(MessageKey<K>, Message<V>)>> {
        self.next_message_in(self.root, after)
    }

    fn next_message_in(
        &mut self,
        id: NodeId,
        after: Option<&MessageKey<K>>,
    ) -> Result<Option<(MessageKey<K>, Message<V>)>> {
        let node = self.swap.checkout(id)?;
        let result = self.next_message_node(&node, after);
        self.swap.checkin(id, node, false);
        result
    }

    fn next_message_node(
        &mut self,
        node: &Node<K, V>,
        after: Option<&MessageKey<K>>,
    ) -> Result<Option<(MessageKey<K>, Message<V>)>> {
        let own = node.first_message_after(after);
        if node.is_leaf() {
            return Ok(own);
        }

        // A cursor below the first pivot routes like no cursor at all.
        let effective = after.filter(|mkey| {
            node.pivots
                .keys()
                .next()
                .map(|first| mkey.key >= *first)
                .unwrap_or(false)
        });

        // Children are walked in key order from the routing position; the
        // first child holding a message past the cursor yields the
        // smallest one below this node.
        for child in node.child_ids_from(effective.map(|mkey| &mkey.key)) {
            if let Some(from_child) = self.next_message_in(child, effective)? {
                return Ok(Some(match own {
                    Some(own) if own.0 < from_child.0 => own,
                    _ => from_child,
                }));
            }
        }
        Ok(own)
    }
}
