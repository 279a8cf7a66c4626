//! Lazy ordered iteration over the effective key-value map.

use std::ops::{Bound, RangeBounds};

use betula_common::Result;

use crate::message::{Message, MessageKey};
use crate::tree::Betree;
use crate::{TreeKey, TreeValue};

/// Ordered scan over the live records of a tree.
///
/// The scan walks the tree's messages in (key, timestamp) order and folds
/// every message for a key into one record, exactly as a point query
/// would: an Insert seeds the value, Updates accumulate onto it (or onto
/// the identity), a Delete invalidates it. Keys whose fold ends invalid
/// yield nothing. The sequence is lazy, finite, and not restartable.
pub struct Scan<'a, K: TreeKey, V: TreeValue> {
    tree: &'a mut Betree<K, V>,
    /// Last message key consumed; the next fetch resumes after it.
    cursor: Option<MessageKey<K>>,
    /// Lookahead message already fetched past a record boundary.
    pending: Option<(MessageKey<K>, Message<V>)>,
    /// End bound on user keys.
    upper: Bound<K>,
    done: bool,
}

impl<'a, K: TreeKey, V: TreeValue> Scan<'a, K, V> {
    pub(crate) fn new<R: RangeBounds<K>>(tree: &'a mut Betree<K, V>, range: R) -> Self {
        // An inclusive start resumes after the key's low sentinel (real
        // timestamps start above it); an exclusive start after its high
        // sentinel.
        let cursor = match range.start_bound() {
            Bound::Unbounded => None,
            Bound::Included(key) => Some(MessageKey::range_start(key.clone())),
            Bound::Excluded(key) => Some(MessageKey::range_end(key.clone())),
        };
        let upper = match range.end_bound() {
            Bound::Unbounded => Bound::Unbounded,
            Bound::Included(key) => Bound::Included(key.clone()),
            Bound::Excluded(key) => Bound::Excluded(key.clone()),
        };
        Self {
            tree,
            cursor,
            pending: None,
            upper,
            done: false,
        }
    }

    fn fetch(&mut self) -> Result<Option<(MessageKey<K>, Message<V>)>> {
        if let Some(pending) = self.pending.take() {
            return Ok(Some(pending));
        }
        self.tree.next_message(self.cursor.as_ref())
    }

    fn past_upper(&self, key: &K) -> bool {
        match &self.upper {
            Bound::Unbounded => false,
            Bound::Included(upper) => key > upper,
            Bound::Excluded(upper) => key >= upper,
        }
    }
}

impl<K: TreeKey, V: TreeValue> Iterator for Scan<'_, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let (head_key, head_message) = match self.fetch() {
                Ok(Some(message)) => message,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            let key = head_key.key.clone();
            if self.past_upper(&key) {
                self.done = true;
                return None;
            }

            // Fold every message for this key, oldest first.
            let mut live: Option<V> = None;
            self.cursor = Some(head_key);
            let mut message = head_message;
            loop {
                match &message {
                    Message::Insert(value) => live = Some(value.clone()),
                    Message::Update(delta) => {
                        let mut value = live.take().unwrap_or_else(V::identity);
                        value.accumulate(delta);
                        live = Some(value);
                    }
                    Message::Delete => live = None,
                }

                match self.fetch() {
                    Ok(Some((next_key, next_message))) => {
                        if next_key.key == key {
                            self.cursor = Some(next_key);
                            message = next_message;
                        } else {
                            self.pending = Some((next_key, next_message));
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }

            if let Some(value) = live {
                return Some(Ok((key, value)));
            }
            // Deleted key; continue with the next one.
        }
    }
}
