//! The B-epsilon tree node and its structural algorithms.
//!
//! A node is two ordered maps: `pivots`, routing keys to children, and
//! `elements`, the buffer of pending messages keyed by (key, timestamp).
//! A node with no pivots is a leaf, and its buffer holds materialized
//! state: at most one `Insert` per user key.
//!
//! Nodes have a fixed maximum size split between the two maps by epsilon:
//! `max_pivots = snap4(max_node_size^epsilon)` routing slots, the rest
//! message slots. A leaf that overflows splits. An internal node that
//! overflows first tries to flush a large contiguous batch of messages to
//! one child, and splits only when no batch is worth flushing. In-memory
//! nodes may exceed the maximum transiently during a flush; the flush
//! restores the bound in the subtree before returning.
//!
//! Flushing is I/O-aware: a batch bound for a child that is already dirty
//! costs nothing extra to push down, a clean in-memory child costs a
//! write-back, and an on-disk child must be paged in first. The size bar
//! a batch must meet scales accordingly.

use std::collections::BTreeMap;

use betula_common::{BetulaError, NodeId, Result, TreeConfig};

use crate::message::{Message, MessageKey};
use crate::tree::Betree;
use crate::wst::WindowStatTracker;
use crate::{TreeKey, TreeValue};

pub(crate) type PivotMap<K> = BTreeMap<K, ChildInfo>;
pub(crate) type MessageMap<K, V> = BTreeMap<MessageKey<K>, Message<V>>;

/// Routing entry for one child subtree: the child's node id and its size
/// in pivots plus buffered messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildInfo {
    pub child: NodeId,
    pub child_size: u64,
}

/// One B-epsilon tree node.
#[derive(Debug, Clone)]
pub(crate) struct Node<K, V> {
    /// Routing keys to children. Empty exactly when this is a leaf.
    pub(crate) pivots: PivotMap<K>,
    /// Buffered messages; materialized state on leaves.
    pub(crate) elements: MessageMap<K, V>,
    /// Pivot/buffer split parameter, in (0, 1).
    pub(crate) epsilon: f32,
    /// Tuning depth for the epsilon controller; root is 0.
    pub(crate) level: u64,
    pub(crate) node_id: NodeId,
    /// Candidate for tree shortening on the next read.
    pub(crate) adoption_flag: bool,

    pub(crate) max_node_size: u64,
    pub(crate) min_flush_size: u64,
    pub(crate) max_pivots: u64,
    pub(crate) max_messages: u64,

    pub(crate) operation_count: u64,
    pub(crate) ops_before_epsilon_update: u64,
    pub(crate) tracker: WindowStatTracker,
}

impl<K: TreeKey, V: TreeValue> Node<K, V> {
    pub(crate) fn new(epsilon: f32, level: u64, config: &TreeConfig) -> Self {
        let max_pivots = Self::calculate_max_pivots(config.max_node_size, epsilon);
        Self {
            pivots: BTreeMap::new(),
            elements: BTreeMap::new(),
            epsilon,
            level,
            node_id: NodeId::INVALID,
            adoption_flag: false,
            max_node_size: config.max_node_size,
            min_flush_size: config.min_flush_size,
            max_pivots,
            max_messages: config.max_node_size.saturating_sub(max_pivots),
            operation_count: 0,
            ops_before_epsilon_update: config.ops_before_update,
            tracker: WindowStatTracker::new(config.window_size),
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.pivots.is_empty()
    }

    /// Node size in pivots plus buffered messages.
    pub(crate) fn weight(&self) -> u64 {
        (self.pivots.len() + self.elements.len()) as u64
    }

    pub(crate) fn child_ids(&self) -> Vec<NodeId> {
        self.pivots.values().map(|info| info.child).collect()
    }

    /// Pivot capacity for a node size and epsilon: B = round(size^epsilon)
    /// snapped to a multiple of 4. The tie at remainder 2 rounds up for
    /// large nodes (biasing wide fanout for reads) and down otherwise.
    pub(crate) fn calculate_max_pivots(max_node_size: u64, epsilon: f32) -> u64 {
        let b = (max_node_size as f32).powf(epsilon).round() as i64;
        let remainder = b % 4;
        let snapped = if remainder < 2 {
            b - remainder
        } else if remainder == 2 {
            if b > 32 {
                b + 2
            } else {
                b - 2
            }
        } else {
            b + (4 - remainder)
        };
        snapped.max(0) as u64
    }

    /// Installs a new epsilon and recomputes the derived capacities.
    ///
    /// At the tunable level this propagates the new shape to every
    /// descendant, and a grown pivot capacity flags the subtree for
    /// adoption; above the tunable level only this node is flagged.
    pub(crate) fn set_epsilon(&mut self, epsilon: f32, tree: &mut Betree<K, V>) -> Result<()> {
        let prev_max_pivots = self.max_pivots;

        self.epsilon = epsilon;
        self.max_pivots = Self::calculate_max_pivots(self.max_node_size, epsilon);
        self.max_messages = self.max_node_size.saturating_sub(self.max_pivots);

        if self.max_pivots != prev_max_pivots
            && self.level == tree.config.tunable_epsilon_level
            && tree.config.is_dynamic
        {
            tree.propagate_epsilon(
                self.child_ids(),
                self.epsilon,
                self.max_pivots,
                self.max_messages,
            )?;
        }

        if self.max_pivots > prev_max_pivots {
            if self.level == tree.config.tunable_epsilon_level {
                self.adoption_flag = true;
                tree.flag_subtree_for_adoption(self.child_ids())?;
            } else if self.level < tree.config.tunable_epsilon_level {
                self.adoption_flag = true;
            }
        }
        Ok(())
    }

    /// Records a read in the statistics window, periodically retuning
    /// epsilon.
    pub(crate) fn add_read(&mut self, tree: &mut Betree<K, V>) -> Result<()> {
        self.tracker.add_read();
        self.operation_count += 1;
        if self.operation_count == self.ops_before_epsilon_update {
            let epsilon = self.tracker.epsilon();
            self.set_epsilon(epsilon, tree)?;
            self.operation_count = 0;
        }
        Ok(())
    }

    /// Records a write in the statistics window, periodically retuning
    /// epsilon.
    pub(crate) fn add_write(&mut self, tree: &mut Betree<K, V>) -> Result<()> {
        self.tracker.add_write();
        self.operation_count += 1;
        if self.operation_count == self.ops_before_epsilon_update {
            let epsilon = self.tracker.epsilon();
            self.set_epsilon(epsilon, tree)?;
            self.operation_count = 0;
        }
        Ok(())
    }

    /// Returns the pivot routing the given key: the largest pivot key
    /// less than or equal to it.
    pub(crate) fn get_pivot(&self, key: &K) -> Result<(&K, &ChildInfo)> {
        self.pivots
            .range(..=key)
            .next_back()
            .ok_or(BetulaError::OutOfRange)
    }

    /// First buffered message for the given user key, if any.
    pub(crate) fn first_message_for(&self, key: &K) -> Option<(&MessageKey<K>, &Message<V>)> {
        self.elements
            .range(MessageKey::range_start(key.clone())..)
            .next()
            .filter(|(mkey, _)| mkey.key == *key)
    }

    /// Number of buffered messages routed to the child at `child_key`,
    /// whose range is bounded above by the next pivot key.
    fn routed_count(&self, child_key: &K, upper: Option<&K>) -> usize {
        let start = MessageKey::range_start(child_key.clone());
        match upper {
            Some(upper) => self
                .elements
                .range(start..MessageKey::range_start(upper.clone()))
                .count(),
            None => self.elements.range(start..).count(),
        }
    }

    /// Removes and returns the buffered messages routed to the child at
    /// `child_key`.
    fn take_routed(&mut self, child_key: &K, upper: Option<&K>) -> MessageMap<K, V> {
        let mut taken = self
            .elements
            .split_off(&MessageKey::range_start(child_key.clone()));
        if let Some(upper) = upper {
            let mut rest = taken.split_off(&MessageKey::range_start(upper.clone()));
            self.elements.append(&mut rest);
        }
        taken
    }

    /// Removes every buffered message for the given user key.
    fn remove_key_messages(&mut self, key: &K) {
        let doomed: Vec<MessageKey<K>> = self
            .elements
            .range(MessageKey::range_start(key.clone())..=MessageKey::range_end(key.clone()))
            .map(|(mkey, _)| mkey.clone())
            .collect();
        for mkey in doomed {
            self.elements.remove(&mkey);
        }
    }

    /// Applies a single message to this node's buffer, merging it with
    /// any messages already buffered for the same user key.
    ///
    /// The message must be newer than everything buffered here for its
    /// key; flush and upsert guarantee this by construction.
    pub(crate) fn apply(&mut self, mkey: MessageKey<K>, message: Message<V>) {
        match message {
            Message::Insert(_) => {
                self.remove_key_messages(&mkey.key);
                self.elements.insert(mkey, message);
            }
            Message::Delete => {
                self.remove_key_messages(&mkey.key);
                // Leaves materialize state, so the tombstone itself is
                // dropped there.
                if !self.is_leaf() {
                    self.elements.insert(mkey, Message::Delete);
                }
            }
            Message::Update(delta) => {
                let newest = self
                    .elements
                    .range(
                        MessageKey::range_start(mkey.key.clone())
                            ..=MessageKey::range_end(mkey.key.clone()),
                    )
                    .next_back()
                    .map(|(_, message)| message.clone());
                match newest {
                    None => {
                        if self.is_leaf() {
                            // Synthesize the initial value from the identity.
                            let mut value = V::identity();
                            value.accumulate(&delta);
                            self.apply(mkey, Message::Insert(value));
                        } else {
                            self.elements.insert(mkey, Message::Update(delta));
                        }
                    }
                    Some(Message::Insert(existing)) => {
                        let mut value = existing;
                        value.accumulate(&delta);
                        self.apply(mkey, Message::Insert(value));
                    }
                    Some(_) => {
                        self.elements.insert(mkey, Message::Update(delta));
                    }
                }
            }
        }
    }

    /// Merges an incoming batch into this node and restores the size
    /// invariants in the subtree below it.
    ///
    /// Returns an empty map when this node survives, or the pivot map of
    /// new siblings when it split; the caller splices those in place of
    /// its pivot entry for this node.
    pub(crate) fn flush(
        &mut self,
        tree: &mut Betree<K, V>,
        elts: MessageMap<K, V>,
    ) -> Result<PivotMap<K>> {
        if tree.config.is_dynamic && self.level <= tree.config.tunable_epsilon_level {
            self.add_write(tree)?;
        }

        if elts.is_empty() {
            return Ok(PivotMap::new());
        }

        // Leaves only buffer state; split if this one got too big.
        if self.is_leaf() {
            for (mkey, message) in elts {
                self.apply(mkey, message);
            }
            if self.elements.len() as u64 >= self.max_messages {
                return self.split(tree);
            }
            return Ok(PivotMap::new());
        }

        // Rename the first pivot down if the batch brings a smaller key.
        let batch_min = elts.keys().next().expect("batch is non-empty").key.clone();
        let first_pivot = self.pivots.keys().next().expect("non-leaf").clone();
        if batch_min < first_pivot {
            let info = self.pivots.remove(&first_pivot).expect("first pivot exists");
            self.pivots.insert(batch_min, info);
        }

        let first_key = &elts.keys().next().expect("batch is non-empty").key;
        let last_key = &elts.keys().next_back().expect("batch is non-empty").key;
        let (first_target, first_info) = {
            let (key, info) = self.get_pivot(first_key)?;
            (key.clone(), *info)
        };
        let last_target = self.get_pivot(last_key)?.0.clone();

        if first_target == last_target && tree.swap.is_dirty(first_info.child) {
            // Fast path: the whole batch routes to a single child that is
            // already dirty, so pushing it further down costs no new I/O.
            let new_children = tree.flush_node(first_info.child, elts)?;
            if !new_children.is_empty() {
                self.pivots.remove(&first_target);
                self.pivots.extend(new_children);
            } else {
                let weight = tree.node_weight(first_info.child)?;
                self.pivots
                    .get_mut(&first_target)
                    .expect("pivot exists")
                    .child_size = weight;
            }
        } else {
            // Buffer the batch here, then flush large slices down until
            // the size invariants hold again.
            for (mkey, message) in elts {
                self.apply(mkey, message);
            }

            while self.elements.len() as u64 >= self.max_messages
                || self.pivots.len() as u64 >= self.max_pivots
            {
                // Child with the largest contiguous buffered slice.
                let pivot_keys: Vec<K> = self.pivots.keys().cloned().collect();
                let mut best: Option<(usize, usize)> = None;
                for (i, pivot_key) in pivot_keys.iter().enumerate() {
                    let count = self.routed_count(pivot_key, pivot_keys.get(i + 1));
                    if count > best.map(|(_, c)| c).unwrap_or(0) {
                        best = Some((i, count));
                    }
                }
                let Some((index, batch_len)) = best else {
                    break;
                };
                let child_key = pivot_keys[index].clone();
                let child_info = *self.pivots.get(&child_key).expect("pivot exists");

                // Flushing to an on-disk child must pay a read and a
                // write; a resident child only the write. Batches smaller
                // than the corresponding bar stay buffered.
                let resident = tree.swap.is_in_memory(child_info.child);
                let worth_flushing = batch_len as u64 >= self.min_flush_size
                    || (batch_len as u64 >= self.min_flush_size / 2 && resident);
                if !worth_flushing {
                    break;
                }

                let batch = self.take_routed(&child_key, pivot_keys.get(index + 1));
                let new_children = tree.flush_node(child_info.child, batch)?;
                if !new_children.is_empty() {
                    self.pivots.remove(&child_key);
                    self.pivots.extend(new_children);
                } else {
                    let weight = tree.node_weight(child_info.child)?;
                    self.pivots
                        .get_mut(&child_key)
                        .expect("pivot exists")
                        .child_size = weight;
                }
            }
        }

        // Too many pivots to flush anything worthwhile; split instead.
        if self.pivots.len() as u64 > self.max_pivots {
            return self.split(tree);
        }
        Ok(PivotMap::new())
    }

    /// Splits this node into siblings of roughly 0.4-0.6 the node
    /// capacity, consuming it. Returns the routing map for the siblings,
    /// keyed by each sibling's lowest routed key.
    pub(crate) fn split(&mut self, tree: &mut Betree<K, V>) -> Result<PivotMap<K>> {
        debug_assert!(
            self.pivots.len() as u64 >= self.max_pivots
                || self.elements.len() as u64 >= self.max_messages
        );

        let total = self.pivots.len() + self.elements.len();
        let divisor = ((10 * self.max_node_size) / 24).max(1) as usize;
        let num_new = (total / divisor).max(2);
        let per_new = (total + num_new - 1) / num_new;

        let mut result = PivotMap::new();
        let mut pivots = std::mem::take(&mut self.pivots).into_iter().peekable();
        let mut elements = std::mem::take(&mut self.elements).into_iter().peekable();
        let mut moved = 0usize;

        for i in 0..num_new {
            if pivots.peek().is_none() && elements.peek().is_none() {
                break;
            }
            let mut sibling = Node::new(self.epsilon, self.level + 1, &tree.config);
            let route_key = match pivots.peek() {
                Some((key, _)) => key.clone(),
                None => elements.peek().expect("items remain").0.key.clone(),
            };

            while moved < (i + 1) * per_new
                && (pivots.peek().is_some() || elements.peek().is_some())
            {
                if let Some((pivot_key, info)) = pivots.next() {
                    sibling.pivots.insert(pivot_key, info);
                    moved += 1;
                    // Every buffered message routed to that pivot moves
                    // with it.
                    let upper = pivots.peek().map(|(key, _)| key.clone());
                    while let Some((mkey, _)) = elements.peek() {
                        if let Some(upper) = &upper {
                            if mkey.key >= *upper {
                                break;
                            }
                        }
                        let (mkey, message) = elements.next().expect("peeked");
                        sibling.elements.insert(mkey, message);
                        moved += 1;
                    }
                } else {
                    // Leaf split: elements alone.
                    let (mkey, message) = elements.next().expect("peeked");
                    sibling.elements.insert(mkey, message);
                    moved += 1;
                }
            }

            let id = tree.swap.allocate_id();
            sibling.node_id = id;
            let weight = sibling.weight();
            tree.swap.insert(id, sibling);
            result.insert(
                route_key,
                ChildInfo {
                    child: id,
                    child_size: weight,
                },
            );
        }

        Ok(result)
    }

    /// Greedily merges runs of consecutive small children into single
    /// nodes. Optional maintenance; never run on the flush or query path.
    pub(crate) fn merge_small_children(&mut self, tree: &mut Betree<K, V>) -> Result<()> {
        if self.is_leaf() {
            return Ok(());
        }
        let threshold = 6 * self.max_node_size / 10;
        let entries: Vec<(K, ChildInfo)> = self
            .pivots
            .iter()
            .map(|(key, info)| (key.clone(), *info))
            .collect();

        let mut index = 0;
        while index < entries.len() {
            let mut total = 0u64;
            let mut end = index;
            while end < entries.len() && total + entries[end].1.child_size <= threshold {
                total += entries[end].1.child_size;
                end += 1;
            }

            if end > index + 1 {
                let group = &entries[index..end];
                let mut merged = Node::new(self.epsilon, self.level, &tree.config);
                for (_, info) in group {
                    let (mut pivots, mut elements) = tree
                        .swap
                        .peek(info.child, |c| (c.pivots.clone(), c.elements.clone()))?;
                    merged.pivots.append(&mut pivots);
                    merged.elements.append(&mut elements);
                }
                let id = tree.swap.allocate_id();
                merged.node_id = id;
                let weight = merged.weight();
                tree.swap.insert(id, merged);

                for (key, info) in group {
                    self.pivots.remove(key);
                    tree.swap.free(info.child)?;
                }
                self.pivots.insert(
                    group[0].0.clone(),
                    ChildInfo {
                        child: id,
                        child_size: weight,
                    },
                );
            }

            index = end.max(index + 1);
        }
        Ok(())
    }

    /// Tree shortening: take grandchildren as direct children and drop
    /// the intermediate nodes. A family of grandchildren is adopted only
    /// when all of it fits under the pivot bound; consumed children have
    /// their buffered messages re-buffered here.
    pub(crate) fn adopt(&mut self, tree: &mut Betree<K, V>) -> Result<()> {
        if self.is_leaf() || self.pivots.len() as u64 >= self.max_pivots {
            self.adoption_flag = false;
            return Ok(());
        }

        let candidates: Vec<(K, NodeId)> = self
            .pivots
            .iter()
            .map(|(key, info)| (key.clone(), info.child))
            .collect();

        for (pivot_key, child_id) in candidates {
            let (child_is_leaf, grandchild_count) = tree
                .swap
                .peek(child_id, |c| (c.is_leaf(), c.pivots.len()))?;
            if child_is_leaf || grandchild_count == 0 {
                continue;
            }
            if (self.pivots.len() - 1 + grandchild_count) as u64 > self.max_pivots {
                continue;
            }

            let (mut grandchildren, child_elements) = tree
                .swap
                .peek(child_id, |c| (c.pivots.clone(), c.elements.clone()))?;

            self.absorb_elements(child_elements);

            self.pivots.remove(&pivot_key);
            for info in grandchildren.values() {
                tree.decrement_level(info.child)?;
            }
            // The adoptees must keep covering the consumed child's whole
            // span: rename their lowest pivot down to the erased key.
            if let Some(first) = grandchildren.keys().next().cloned() {
                if first > pivot_key {
                    let info = grandchildren.remove(&first).expect("first exists");
                    grandchildren.insert(pivot_key.clone(), info);
                }
            }
            self.pivots.extend(grandchildren);
            tree.swap.free(child_id)?;
        }

        // Structural rewrite done; refresh the child sizes.
        let children: Vec<(K, NodeId)> = self
            .pivots
            .iter()
            .map(|(key, info)| (key.clone(), info.child))
            .collect();
        for (key, id) in children {
            let weight = tree.node_weight(id)?;
            self.pivots.get_mut(&key).expect("pivot exists").child_size = weight;
        }

        self.adoption_flag = false;
        Ok(())
    }

    /// Re-buffers a consumed child's messages into this node.
    ///
    /// The child's messages are strictly older than anything buffered
    /// here for the same keys, because a flush always moves the whole
    /// contiguous slice for a key down. A key whose newest local message
    /// is an Insert or Delete therefore supersedes the incoming group;
    /// otherwise the group is inserted verbatim, sorting ahead of the
    /// local messages by timestamp.
    fn absorb_elements(&mut self, incoming: MessageMap<K, V>) {
        let mut incoming = incoming.into_iter().peekable();
        while let Some((mkey, message)) = incoming.next() {
            let key = mkey.key.clone();
            let superseded = matches!(
                self.first_message_for(&key),
                Some((_, Message::Insert(_))) | Some((_, Message::Delete))
            );
            if !superseded {
                self.elements.insert(mkey, message);
            }
            while incoming
                .peek()
                .map(|(next, _)| next.key == key)
                .unwrap_or(false)
            {
                let (mkey, message) = incoming.next().expect("peeked");
                if !superseded {
                    self.elements.insert(mkey, message);
                }
            }
        }
    }

    /// Point lookup through this node's buffer and subtree.
    pub(crate) fn query(&mut self, tree: &mut Betree<K, V>, key: &K) -> Result<V> {
        if tree.config.is_dynamic && self.level <= tree.config.tunable_epsilon_level {
            self.add_read(tree)?;
        }

        if self.is_leaf() {
            return match self.first_message_for(key) {
                Some((_, Message::Insert(value))) => Ok(value.clone()),
                Some((mkey, _)) => Err(BetulaError::NodeCorrupted {
                    node_id: self.node_id.0,
                    reason: format!("leaf buffers a non-insert message for {:?}", mkey.key),
                }),
                None => Err(BetulaError::KeyNotFound),
            };
        }

        // Snapshot this key's buffered messages; the child recursion must
        // not hold a borrow of the buffer.
        let buffered: Vec<Message<V>> = self
            .elements
            .range(MessageKey::range_start(key.clone())..=MessageKey::range_end(key.clone()))
            .map(|(_, message)| message.clone())
            .collect();

        let mut found: Option<V> = None;
        let mut fold_from = 0;

        match buffered.first() {
            None => {
                // Nothing buffered for this key; the subtree decides. A
                // key below the first pivot cannot exist anywhere.
                let child = match self.get_pivot(key) {
                    Ok((_, info)) => info.child,
                    Err(BetulaError::OutOfRange) => return Err(BetulaError::KeyNotFound),
                    Err(e) => return Err(e),
                };
                found = Some(tree.query_node(child, key)?);
            }
            Some(Message::Update(_)) => {
                // Updates fold onto whatever the subtree holds, or onto
                // the identity if it holds nothing.
                let child = self.get_pivot(key)?.1.child;
                match tree.query_node(child, key) {
                    Ok(value) => found = Some(value),
                    Err(BetulaError::KeyNotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            Some(Message::Delete) => {
                // A tombstone cuts off the subtree. The key exists only
                // if newer messages follow in this buffer.
                fold_from = 1;
                match buffered.get(1) {
                    None => return Err(BetulaError::KeyNotFound),
                    Some(Message::Insert(value)) => {
                        found = Some(value.clone());
                        fold_from = 2;
                    }
                    Some(Message::Update(_)) => {}
                    Some(Message::Delete) => {
                        return Err(BetulaError::NodeCorrupted {
                            node_id: self.node_id.0,
                            reason: "duplicate tombstone in buffer".to_string(),
                        })
                    }
                }
            }
            Some(Message::Insert(value)) => {
                found = Some(value.clone());
                fold_from = 1;
            }
        }

        for message in &buffered[fold_from..] {
            match message {
                Message::Update(delta) => {
                    let mut value = found.take().unwrap_or_else(V::identity);
                    value.accumulate(delta);
                    found = Some(value);
                }
                _ => {
                    return Err(BetulaError::NodeCorrupted {
                        node_id: self.node_id.0,
                        reason: "terminal message after the first in a buffer run".to_string(),
                    })
                }
            }
        }

        // Reads have already paid to pin this node, so shorten the tree
        // now if it was flagged.
        if self.adoption_flag {
            self.adopt(tree)?;
        }

        match found {
            Some(value) => Ok(value),
            None => Err(BetulaError::KeyNotFound),
        }
    }

    /// First buffered message strictly after the given message key.
    pub(crate) fn first_message_after(
        &self,
        after: Option<&MessageKey<K>>,
    ) -> Option<(MessageKey<K>, Message<V>)> {
        let entry = match after {
            Some(mkey) => self
                .elements
                .range((std::ops::Bound::Excluded(mkey), std::ops::Bound::Unbounded))
                .next(),
            None => self.elements.iter().next(),
        };
        entry.map(|(mkey, message)| (mkey.clone(), message.clone()))
    }

    /// Children from the one routing the given key onward; all children
    /// when the key is absent or below the first pivot.
    pub(crate) fn child_ids_from(&self, key: Option<&K>) -> Vec<NodeId> {
        let start = key.and_then(|k| self.pivots.range(..=k).next_back().map(|(p, _)| p.clone()));
        match start {
            Some(pivot_key) => self
                .pivots
                .range(pivot_key..)
                .map(|(_, info)| info.child)
                .collect(),
            None => self.child_ids(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf() -> Node<u64, String> {
        Node::new(0.4, 0, &TreeConfig::default())
    }

    fn internal() -> Node<u64, String> {
        let mut node = leaf();
        node.pivots.insert(
            0,
            ChildInfo {
                child: NodeId(1),
                child_size: 0,
            },
        );
        node.pivots.insert(
            100,
            ChildInfo {
                child: NodeId(2),
                child_size: 0,
            },
        );
        node
    }

    fn mkey(key: u64, timestamp: u64) -> MessageKey<u64> {
        MessageKey::new(key, timestamp)
    }

    #[test]
    fn test_calculate_max_pivots_snaps_to_four() {
        // B = 64^0.5 = 8, remainder 0
        assert_eq!(Node::<u64, String>::calculate_max_pivots(64, 0.5), 8);
        // B = 25^0.5 = 5, remainder 1 rounds down
        assert_eq!(Node::<u64, String>::calculate_max_pivots(25, 0.5), 4);
        // B = 49^0.5 = 7, remainder 3 rounds up
        assert_eq!(Node::<u64, String>::calculate_max_pivots(49, 0.5), 8);
        // B = 676^0.5 = 26, remainder 2 with B <= 32 rounds down
        assert_eq!(Node::<u64, String>::calculate_max_pivots(676, 0.5), 24);
        // B = 1156^0.5 = 34, remainder 2 with B > 32 rounds up
        assert_eq!(Node::<u64, String>::calculate_max_pivots(1156, 0.5), 36);
    }

    #[test]
    fn test_default_capacities() {
        let node = leaf();
        // 64^0.4 rounds to 5, snapping down to 4
        assert_eq!(node.max_pivots, 4);
        assert_eq!(node.max_messages, 60);
    }

    #[test]
    fn test_apply_insert_supersedes() {
        let mut node = leaf();
        node.apply(mkey(1, 1), Message::Insert("a".to_string()));
        node.apply(mkey(1, 2), Message::Update("b".to_string()));
        node.apply(mkey(1, 3), Message::Insert("z".to_string()));

        assert_eq!(node.elements.len(), 1);
        let (only_key, only_message) = node.elements.iter().next().unwrap();
        assert_eq!(only_key, &mkey(1, 3));
        assert_eq!(only_message, &Message::Insert("z".to_string()));
    }

    #[test]
    fn test_apply_delete_on_leaf_drops_tombstone() {
        let mut node = leaf();
        node.apply(mkey(1, 1), Message::Insert("a".to_string()));
        node.apply(mkey(1, 2), Message::Delete);

        assert!(node.elements.is_empty());
    }

    #[test]
    fn test_apply_delete_on_internal_keeps_tombstone() {
        let mut node = internal();
        node.apply(mkey(1, 1), Message::Insert("a".to_string()));
        node.apply(mkey(1, 2), Message::Delete);

        assert_eq!(node.elements.len(), 1);
        assert_eq!(node.elements.get(&mkey(1, 2)), Some(&Message::Delete));
    }

    #[test]
    fn test_apply_update_on_empty_leaf_synthesizes_insert() {
        let mut node = leaf();
        node.apply(mkey(1, 1), Message::Update("b".to_string()));

        assert_eq!(
            node.elements.get(&mkey(1, 1)),
            Some(&Message::Insert("b".to_string()))
        );
    }

    #[test]
    fn test_apply_update_on_empty_internal_defers() {
        let mut node = internal();
        node.apply(mkey(1, 1), Message::Update("b".to_string()));

        assert_eq!(
            node.elements.get(&mkey(1, 1)),
            Some(&Message::Update("b".to_string()))
        );
    }

    #[test]
    fn test_apply_update_collapses_onto_insert() {
        let mut node = internal();
        node.apply(mkey(1, 1), Message::Insert("a".to_string()));
        node.apply(mkey(1, 2), Message::Update("b".to_string()));

        assert_eq!(node.elements.len(), 1);
        assert_eq!(
            node.elements.get(&mkey(1, 2)),
            Some(&Message::Insert("ab".to_string()))
        );
    }

    #[test]
    fn test_apply_update_after_delete_is_preserved() {
        let mut node = internal();
        node.apply(mkey(1, 1), Message::Delete);
        node.apply(mkey(1, 2), Message::Update("b".to_string()));

        assert_eq!(node.elements.len(), 2);
        assert_eq!(node.elements.get(&mkey(1, 1)), Some(&Message::Delete));
        assert_eq!(
            node.elements.get(&mkey(1, 2)),
            Some(&Message::Update("b".to_string()))
        );
    }

    #[test]
    fn test_apply_update_chains_after_delete() {
        let mut node = internal();
        node.apply(mkey(1, 1), Message::Delete);
        node.apply(mkey(1, 2), Message::Update("b".to_string()));
        node.apply(mkey(1, 3), Message::Update("c".to_string()));

        // Delete, Update, Update: updates after a non-insert stack up.
        assert_eq!(node.elements.len(), 3);
    }

    #[test]
    fn test_get_pivot_routes_to_floor() {
        let node = internal();
        assert_eq!(node.get_pivot(&0).unwrap().1.child, NodeId(1));
        assert_eq!(node.get_pivot(&50).unwrap().1.child, NodeId(1));
        assert_eq!(node.get_pivot(&100).unwrap().1.child, NodeId(2));
        assert_eq!(node.get_pivot(&999).unwrap().1.child, NodeId(2));
    }

    #[test]
    fn test_get_pivot_below_first_is_out_of_range() {
        let mut node = leaf();
        node.pivots.insert(
            10,
            ChildInfo {
                child: NodeId(1),
                child_size: 0,
            },
        );
        assert!(matches!(
            node.get_pivot(&5),
            Err(BetulaError::OutOfRange)
        ));
    }

    #[test]
    fn test_routed_count_and_take() {
        let mut node = internal();
        node.elements
            .insert(mkey(5, 1), Message::Insert("a".to_string()));
        node.elements
            .insert(mkey(7, 2), Message::Insert("b".to_string()));
        node.elements
            .insert(mkey(150, 3), Message::Insert("c".to_string()));

        assert_eq!(node.routed_count(&0, Some(&100)), 2);
        assert_eq!(node.routed_count(&100, None), 1);

        let taken = node.take_routed(&0, Some(&100));
        assert_eq!(taken.len(), 2);
        assert_eq!(node.elements.len(), 1);
        assert!(node.elements.contains_key(&mkey(150, 3)));
    }

    #[test]
    fn test_absorb_elements_respects_newer_terminals() {
        let mut node = internal();
        // Newer local messages: an insert for key 1, an update for key 2.
        node.elements
            .insert(mkey(1, 10), Message::Insert("new".to_string()));
        node.elements
            .insert(mkey(2, 11), Message::Update("u".to_string()));

        let mut incoming = MessageMap::new();
        // Older child messages for keys 1, 2, 3.
        incoming.insert(mkey(1, 1), Message::Insert("old".to_string()));
        incoming.insert(mkey(1, 2), Message::Update("x".to_string()));
        incoming.insert(mkey(2, 3), Message::Insert("seed".to_string()));
        incoming.insert(mkey(3, 4), Message::Delete);

        node.absorb_elements(incoming);

        // Key 1: local insert supersedes the whole incoming group.
        assert_eq!(
            node.first_message_for(&1).unwrap().1,
            &Message::Insert("new".to_string())
        );
        assert_eq!(node.elements.range(mkey(1, 0)..=mkey(1, u64::MAX)).count(), 1);
        // Key 2: incoming insert seeds under the local update.
        assert_eq!(
            node.first_message_for(&2).unwrap().1,
            &Message::Insert("seed".to_string())
        );
        assert_eq!(node.elements.range(mkey(2, 0)..=mkey(2, u64::MAX)).count(), 2);
        // Key 3: no local messages, absorbed verbatim.
        assert_eq!(node.first_message_for(&3).unwrap().1, &Message::Delete);
    }

    #[test]
    fn test_first_message_after() {
        let mut node = leaf();
        node.apply(mkey(1, 1), Message::Insert("a".to_string()));
        node.apply(mkey(5, 2), Message::Insert("b".to_string()));

        let (first, _) = node.first_message_after(None).unwrap();
        assert_eq!(first, mkey(1, 1));

        let (next, _) = node.first_message_after(Some(&mkey(1, 1))).unwrap();
        assert_eq!(next, mkey(5, 2));

        assert!(node.first_message_after(Some(&mkey(5, 2))).is_none());
    }

    #[test]
    fn test_child_ids_from() {
        let node = internal();
        assert_eq!(node.child_ids_from(None), vec![NodeId(1), NodeId(2)]);
        // Key 50 routes to the first child, so the walk starts there.
        assert_eq!(node.child_ids_from(Some(&50)), vec![NodeId(1), NodeId(2)]);
        assert_eq!(node.child_ids_from(Some(&100)), vec![NodeId(2)]);
    }
}
