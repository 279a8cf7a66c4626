//! Swap space: the in-memory arena of node slots backed by the object store.

use std::collections::HashMap;
use std::path::PathBuf;

use betula_common::{BetulaError, NodeId, Result};

use crate::store::ObjectStore;

/// Serialization seam between the swap space and the objects it manages.
///
/// The codec carries whatever construction-time context is needed to
/// rebuild an object's derived state from its stored form.
pub trait ObjectCodec<T> {
    /// Encodes an object to its stored byte form.
    fn encode(&self, object: &T) -> Result<Vec<u8>>;

    /// Decodes an object from its stored byte form.
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// Residency state of a slot.
enum Residency<T> {
    /// Object is in memory and owned by the swap space.
    Loaded(T),
    /// Object is in memory but currently owned by a caller (pinned).
    CheckedOut,
    /// Object lives only in the backing store.
    Evicted,
}

/// One arena slot.
struct Slot<T> {
    state: Residency<T>,
    /// The in-memory copy differs from (or does not exist in) the store.
    dirty: bool,
    /// Recency tick for eviction ordering.
    last_used: u64,
}

/// Statistics about a swap space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapStats {
    /// Total slots (resident or not).
    pub total: usize,
    /// Slots resident in memory (loaded or checked out).
    pub resident: usize,
    /// Slots currently checked out.
    pub pinned: usize,
    /// Slots whose in-memory copy is dirty.
    pub dirty: usize,
}

/// Manages which node objects are resident in memory.
///
/// The swap space is an arena of slots keyed by [`NodeId`]. Callers take
/// an object out with [`checkout`](SwapSpace::checkout) — which pins the
/// slot — mutate it freely, and return it with
/// [`checkin`](SwapSpace::checkin). The resident count is a soft bound:
/// after each checkin or insert, least-recently-used unpinned slots are
/// evicted until the count fits, writing dirty objects through the store
/// first. Pinned slots are never evicted, so the cache may temporarily
/// overshoot while a recursive operation holds several nodes.
pub struct SwapSpace<T, C: ObjectCodec<T>> {
    store: ObjectStore,
    codec: C,
    capacity: usize,
    slots: HashMap<NodeId, Slot<T>>,
    tick: u64,
    next_id: u64,
}

impl<T, C: ObjectCodec<T>> SwapSpace<T, C> {
    /// Opens a swap space over the given directory, registering any
    /// objects already present in the backing store as evicted slots.
    pub fn open(
        data_dir: impl Into<PathBuf>,
        capacity: usize,
        fsync_enabled: bool,
        codec: C,
    ) -> Result<Self> {
        let store = ObjectStore::open(data_dir, fsync_enabled)?;
        let next_id = store.max_id().map(|id| id.0 + 1).unwrap_or(0);

        let mut slots = HashMap::new();
        for id in store.ids() {
            slots.insert(
                id,
                Slot {
                    state: Residency::Evicted,
                    dirty: false,
                    last_used: 0,
                },
            );
        }

        Ok(Self {
            store,
            codec,
            capacity,
            slots,
            tick: 0,
            next_id,
        })
    }

    /// Hands out a fresh node id.
    pub fn allocate_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Registers a new object under a previously allocated id. The object
    /// starts resident and dirty.
    pub fn insert(&mut self, id: NodeId, object: T) {
        let tick = self.bump_tick();
        self.slots.insert(
            id,
            Slot {
                state: Residency::Loaded(object),
                dirty: true,
                last_used: tick,
            },
        );
        self.evict_excess();
    }

    /// Takes an object out of the arena, paging it in from the store if
    /// it was evicted. The slot is pinned until the matching
    /// [`checkin`](SwapSpace::checkin); a second checkout is an error.
    pub fn checkout(&mut self, id: NodeId) -> Result<T> {
        let tick = self.bump_tick();
        let slot = self
            .slots
            .get_mut(&id)
            .ok_or(BetulaError::NodeNotFound { node_id: id.0 })?;
        slot.last_used = tick;

        if matches!(slot.state, Residency::CheckedOut) {
            return Err(BetulaError::NodeCheckedOut { node_id: id.0 });
        }

        match std::mem::replace(&mut slot.state, Residency::CheckedOut) {
            Residency::Loaded(object) => Ok(object),
            Residency::Evicted => {
                let loaded = self.store.get(id).and_then(|b| self.codec.decode(&b));
                if loaded.is_err() {
                    // Page-in failed; the slot is still only on disk.
                    let slot = self.slots.get_mut(&id).expect("slot exists");
                    slot.state = Residency::Evicted;
                }
                loaded
            }
            Residency::CheckedOut => unreachable!("checked above"),
        }
    }

    /// Returns a checked-out object to its slot. `dirty` records whether
    /// the caller mutated it.
    pub fn checkin(&mut self, id: NodeId, object: T, dirty: bool) {
        let tick = self.bump_tick();
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.state = Residency::Loaded(object);
            slot.dirty |= dirty;
            slot.last_used = tick;
        }
        self.evict_excess();
    }

    /// Runs a closure against a resident object, paging it in on a miss.
    pub fn peek<R>(&mut self, id: NodeId, f: impl FnOnce(&T) -> R) -> Result<R> {
        self.make_resident(id)?;
        let slot = self.slots.get(&id).expect("slot resident");
        match &slot.state {
            Residency::Loaded(object) => Ok(f(object)),
            _ => Err(BetulaError::NodeCheckedOut { node_id: id.0 }),
        }
    }

    /// Runs a mutating closure against a resident object, paging it in on
    /// a miss and marking the slot dirty.
    pub fn peek_mut<R>(&mut self, id: NodeId, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        self.make_resident(id)?;
        let slot = self.slots.get_mut(&id).expect("slot resident");
        match &mut slot.state {
            Residency::Loaded(object) => {
                slot.dirty = true;
                Ok(f(object))
            }
            _ => Err(BetulaError::NodeCheckedOut { node_id: id.0 }),
        }
    }

    /// Returns true if the in-memory copy of a node differs from the store.
    pub fn is_dirty(&self, id: NodeId) -> bool {
        self.slots.get(&id).map(|s| s.dirty).unwrap_or(false)
    }

    /// Returns true if a node is resident in memory (loaded or pinned).
    pub fn is_in_memory(&self, id: NodeId) -> bool {
        matches!(
            self.slots.get(&id).map(|s| &s.state),
            Some(Residency::Loaded(_)) | Some(Residency::CheckedOut)
        )
    }

    /// Returns true if the arena knows this id.
    pub fn contains(&self, id: NodeId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Drops a slot and deletes its backing object. Used when a node is
    /// consumed by a split, merge, or adoption.
    pub fn free(&mut self, id: NodeId) -> Result<()> {
        self.slots.remove(&id);
        self.store.delete(id)
    }

    /// Writes every dirty resident object back to the store and clears
    /// the dirty bits. Fails if any slot is still checked out.
    pub fn flush_all(&mut self) -> Result<()> {
        let ids: Vec<NodeId> = self.slots.keys().copied().collect();
        for id in ids {
            let slot = self.slots.get(&id).expect("slot exists");
            match &slot.state {
                Residency::Loaded(object) if slot.dirty => {
                    let bytes = self.codec.encode(object)?;
                    self.store.put(id, &bytes)?;
                    self.slots.get_mut(&id).expect("slot exists").dirty = false;
                }
                Residency::CheckedOut => {
                    return Err(BetulaError::NodeCheckedOut { node_id: id.0 });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Returns swap statistics.
    pub fn stats(&self) -> SwapStats {
        let mut resident = 0;
        let mut pinned = 0;
        let mut dirty = 0;
        for slot in self.slots.values() {
            match slot.state {
                Residency::Loaded(_) => resident += 1,
                Residency::CheckedOut => {
                    resident += 1;
                    pinned += 1;
                }
                Residency::Evicted => {}
            }
            if slot.dirty {
                dirty += 1;
            }
        }
        SwapStats {
            total: self.slots.len(),
            resident,
            pinned,
            dirty,
        }
    }

    /// Returns the number of known slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the id that will be handed out next.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Overrides the id counter. Used when reopening a tree whose
    /// metadata records a counter past the stored objects.
    pub fn set_next_id(&mut self, next_id: u64) {
        self.next_id = self.next_id.max(next_id);
    }

    fn bump_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Pages an evicted object back into its slot.
    fn make_resident(&mut self, id: NodeId) -> Result<()> {
        let slot = self
            .slots
            .get(&id)
            .ok_or(BetulaError::NodeNotFound { node_id: id.0 })?;
        if matches!(slot.state, Residency::Evicted) {
            let bytes = self.store.get(id)?;
            let object = self.codec.decode(&bytes)?;
            let tick = self.bump_tick();
            let slot = self.slots.get_mut(&id).expect("slot exists");
            slot.state = Residency::Loaded(object);
            slot.dirty = false;
            slot.last_used = tick;
            self.evict_excess();
        }
        Ok(())
    }

    /// Evicts least-recently-used unpinned slots until the resident count
    /// fits the capacity. Dirty victims are written through first.
    fn evict_excess(&mut self) {
        loop {
            let resident = self
                .slots
                .values()
                .filter(|s| matches!(s.state, Residency::Loaded(_)))
                .count();
            let pinned = self
                .slots
                .values()
                .filter(|s| matches!(s.state, Residency::CheckedOut))
                .count();
            if resident + pinned <= self.capacity {
                return;
            }

            let victim = self
                .slots
                .iter()
                .filter(|(_, s)| matches!(s.state, Residency::Loaded(_)))
                .min_by_key(|(_, s)| s.last_used)
                .map(|(id, _)| *id);
            let Some(victim) = victim else {
                // Everything resident is pinned; let the cache overshoot.
                return;
            };

            let slot = self.slots.get_mut(&victim).expect("victim exists");
            let state = std::mem::replace(&mut slot.state, Residency::Evicted);
            let Residency::Loaded(object) = state else {
                unreachable!("victim was loaded");
            };
            if slot.dirty {
                match self.codec.encode(&object) {
                    Ok(bytes) => {
                        if self.store.put(victim, &bytes).is_err() {
                            // Write-back failed; keep the object resident
                            // rather than lose it.
                            let slot = self.slots.get_mut(&victim).expect("victim exists");
                            slot.state = Residency::Loaded(object);
                            return;
                        }
                        self.slots.get_mut(&victim).expect("victim exists").dirty = false;
                    }
                    Err(_) => {
                        let slot = self.slots.get_mut(&victim).expect("victim exists");
                        slot.state = Residency::Loaded(object);
                        return;
                    }
                }
            }
        }
    }
}

/// Recommends a cache capacity sized to 25% of available system RAM for
/// the given estimated per-object byte size. Minimum 16 slots so tiny
/// machines still get a useful cache.
pub fn recommended_capacity(estimated_object_size: usize) -> usize {
    use sysinfo::System;

    let mut sys = System::new_all();
    sys.refresh_memory();

    let available_bytes = sys.available_memory() as usize;
    let target_bytes = available_bytes / 4;
    (target_bytes / estimated_object_size.max(1)).max(16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Test object: a string payload encoded as raw bytes.
    struct TextCodec;

    impl ObjectCodec<String> for TextCodec {
        fn encode(&self, object: &String) -> Result<Vec<u8>> {
            Ok(object.as_bytes().to_vec())
        }

        fn decode(&self, bytes: &[u8]) -> Result<String> {
            String::from_utf8(bytes.to_vec())
                .map_err(|e| BetulaError::Serialization(e.to_string()))
        }
    }

    fn create_test_space(capacity: usize) -> (SwapSpace<String, TextCodec>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let space = SwapSpace::open(dir.path(), capacity, false, TextCodec).unwrap();
        (space, dir)
    }

    #[test]
    fn test_space_allocate_insert() {
        let (mut space, _dir) = create_test_space(8);

        let id = space.allocate_id();
        assert_eq!(id, NodeId(0));
        space.insert(id, "hello".to_string());

        assert!(space.contains(id));
        assert!(space.is_in_memory(id));
        assert!(space.is_dirty(id));
        assert_eq!(space.allocate_id(), NodeId(1));
    }

    #[test]
    fn test_space_checkout_checkin() {
        let (mut space, _dir) = create_test_space(8);

        let id = space.allocate_id();
        space.insert(id, "payload".to_string());

        let mut object = space.checkout(id).unwrap();
        object.push_str(" edited");
        space.checkin(id, object, true);

        assert_eq!(space.peek(id, |o| o.clone()).unwrap(), "payload edited");
    }

    #[test]
    fn test_space_double_checkout_fails() {
        let (mut space, _dir) = create_test_space(8);

        let id = space.allocate_id();
        space.insert(id, "pinned".to_string());

        let object = space.checkout(id).unwrap();
        let second = space.checkout(id);
        assert!(matches!(
            second,
            Err(BetulaError::NodeCheckedOut { node_id: 0 })
        ));

        space.checkin(id, object, false);
        assert!(space.checkout(id).is_ok());
    }

    #[test]
    fn test_space_checkout_missing() {
        let (mut space, _dir) = create_test_space(8);
        assert!(matches!(
            space.checkout(NodeId(42)),
            Err(BetulaError::NodeNotFound { node_id: 42 })
        ));
    }

    #[test]
    fn test_space_eviction_writes_dirty() {
        let (mut space, _dir) = create_test_space(2);

        for i in 0..4 {
            let id = space.allocate_id();
            space.insert(id, format!("object {}", i));
        }

        let stats = space.stats();
        assert_eq!(stats.total, 4);
        assert!(stats.resident <= 2);

        // Evicted objects were written through and page back in intact.
        assert_eq!(space.peek(NodeId(0), |o| o.clone()).unwrap(), "object 0");
        assert_eq!(space.peek(NodeId(1), |o| o.clone()).unwrap(), "object 1");
    }

    #[test]
    fn test_space_pinned_slots_survive_pressure() {
        let (mut space, _dir) = create_test_space(1);

        let a = space.allocate_id();
        space.insert(a, "a".to_string());
        let held = space.checkout(a).unwrap();

        // Inserting more objects under capacity pressure must not touch
        // the pinned slot.
        let b = space.allocate_id();
        space.insert(b, "b".to_string());

        assert!(space.is_in_memory(a));
        space.checkin(a, held, false);
    }

    #[test]
    fn test_space_free_removes_backing() {
        let (mut space, dir) = create_test_space(1);

        let a = space.allocate_id();
        space.insert(a, "a".to_string());
        let b = space.allocate_id();
        space.insert(b, "b".to_string()); // evicts a to disk

        space.free(a).unwrap();
        assert!(!space.contains(a));
        assert!(matches!(
            space.checkout(a),
            Err(BetulaError::NodeNotFound { .. })
        ));

        // Backing file gone too
        let reopened: SwapSpace<String, TextCodec> =
            SwapSpace::open(dir.path(), 4, false, TextCodec).unwrap();
        assert!(!reopened.contains(a));
    }

    #[test]
    fn test_space_flush_all_and_reopen() {
        let dir = tempdir().unwrap();

        {
            let mut space: SwapSpace<String, TextCodec> =
                SwapSpace::open(dir.path(), 8, false, TextCodec).unwrap();
            for i in 0..3 {
                let id = space.allocate_id();
                space.insert(id, format!("durable {}", i));
            }
            space.flush_all().unwrap();
            assert_eq!(space.stats().dirty, 0);
        }

        let mut space: SwapSpace<String, TextCodec> =
            SwapSpace::open(dir.path(), 8, false, TextCodec).unwrap();
        assert_eq!(space.len(), 3);
        assert_eq!(space.next_id(), 3);
        assert_eq!(space.peek(NodeId(2), |o| o.clone()).unwrap(), "durable 2");
    }

    #[test]
    fn test_space_flush_all_with_pin_fails() {
        let (mut space, _dir) = create_test_space(8);

        let id = space.allocate_id();
        space.insert(id, "pinned".to_string());
        let object = space.checkout(id).unwrap();

        assert!(space.flush_all().is_err());
        space.checkin(id, object, false);
        assert!(space.flush_all().is_ok());
    }

    #[test]
    fn test_space_peek_mut_marks_dirty() {
        let (mut space, _dir) = create_test_space(8);

        let id = space.allocate_id();
        space.insert(id, "x".to_string());
        space.flush_all().unwrap();
        assert!(!space.is_dirty(id));

        space.peek_mut(id, |o| o.push('y')).unwrap();
        assert!(space.is_dirty(id));
        assert_eq!(space.peek(id, |o| o.clone()).unwrap(), "xy");
    }

    #[test]
    fn test_space_set_next_id_only_grows() {
        let (mut space, _dir) = create_test_space(8);
        space.set_next_id(10);
        assert_eq!(space.next_id(), 10);
        space.set_next_id(5);
        assert_eq!(space.next_id(), 10);
    }

    #[test]
    fn test_recommended_capacity_floor() {
        assert!(recommended_capacity(usize::MAX) >= 16);
    }
}
