//! Object store for node-level file I/O.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use betula_common::{BetulaError, NodeId, Result};

/// File extension for serialized node objects.
const OBJECT_EXT: &str = "node";

/// Stores serialized node objects, one file per node id, under a data
/// directory.
///
/// The store knows nothing about node contents; it moves opaque byte
/// buffers. Object sizes are tracked in memory so existence checks and
/// stats never touch the filesystem.
pub struct ObjectStore {
    /// Base directory for object files.
    data_dir: PathBuf,
    /// Enable fsync after writes.
    fsync_enabled: bool,
    /// Byte sizes of stored objects, keyed by node id.
    objects: Mutex<HashMap<u64, u64>>,
}

impl ObjectStore {
    /// Opens a store rooted at the given directory, creating it if needed
    /// and scanning any existing object files.
    pub fn open(data_dir: impl Into<PathBuf>, fsync_enabled: bool) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let mut objects = HashMap::new();
        for entry in std::fs::read_dir(&data_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(OBJECT_EXT) {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            if let Ok(id) = u64::from_str_radix(stem, 16) {
                objects.insert(id, entry.metadata()?.len());
            }
        }

        Ok(Self {
            data_dir,
            fsync_enabled,
            objects: Mutex::new(objects),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Generates the file path for a node id.
    fn object_path(&self, id: NodeId) -> PathBuf {
        self.data_dir.join(format!("{:016x}.{}", id.0, OBJECT_EXT))
    }

    /// Writes an object, replacing any previous contents.
    pub fn put(&self, id: NodeId, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(id);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(bytes)?;
        if self.fsync_enabled {
            file.sync_all()?;
        }

        self.objects.lock().insert(id.0, bytes.len() as u64);
        Ok(())
    }

    /// Reads an object back.
    pub fn get(&self, id: NodeId) -> Result<Vec<u8>> {
        if !self.contains(id) {
            return Err(BetulaError::NodeNotFound { node_id: id.0 });
        }

        let mut file = File::open(self.object_path(id))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Deletes an object. Deleting an absent object is a no-op.
    pub fn delete(&self, id: NodeId) -> Result<()> {
        if self.objects.lock().remove(&id.0).is_some() {
            let path = self.object_path(id);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Returns true if an object is stored for the given id.
    pub fn contains(&self, id: NodeId) -> bool {
        self.objects.lock().contains_key(&id.0)
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Returns true if the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Returns the ids of all stored objects, in no particular order.
    pub fn ids(&self) -> Vec<NodeId> {
        self.objects.lock().keys().copied().map(NodeId).collect()
    }

    /// Returns the largest stored node id, if any.
    pub fn max_id(&self) -> Option<NodeId> {
        self.objects.lock().keys().max().copied().map(NodeId)
    }

    /// Returns the total bytes stored.
    pub fn total_bytes(&self) -> u64 {
        self.objects.lock().values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_store() -> (ObjectStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = ObjectStore::open(dir.path(), false).unwrap();
        (store, dir)
    }

    #[test]
    fn test_store_open() {
        let (store, _dir) = create_test_store();
        assert!(store.data_dir().exists());
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_put_get() {
        let (store, _dir) = create_test_store();

        store.put(NodeId(1), b"hello node").unwrap();
        assert!(store.contains(NodeId(1)));
        assert_eq!(store.get(NodeId(1)).unwrap(), b"hello node");
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_bytes(), 10);
    }

    #[test]
    fn test_store_get_missing() {
        let (store, _dir) = create_test_store();

        let result = store.get(NodeId(99));
        assert!(matches!(
            result,
            Err(BetulaError::NodeNotFound { node_id: 99 })
        ));
    }

    #[test]
    fn test_store_overwrite() {
        let (store, _dir) = create_test_store();

        store.put(NodeId(3), b"first").unwrap();
        store.put(NodeId(3), b"second, longer").unwrap();

        assert_eq!(store.get(NodeId(3)).unwrap(), b"second, longer");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_delete() {
        let (store, _dir) = create_test_store();

        store.put(NodeId(5), b"doomed").unwrap();
        store.delete(NodeId(5)).unwrap();

        assert!(!store.contains(NodeId(5)));
        assert!(store.get(NodeId(5)).is_err());

        // Deleting again is a no-op
        store.delete(NodeId(5)).unwrap();
    }

    #[test]
    fn test_store_max_id() {
        let (store, _dir) = create_test_store();
        assert_eq!(store.max_id(), None);

        store.put(NodeId(2), b"a").unwrap();
        store.put(NodeId(7), b"b").unwrap();
        store.put(NodeId(4), b"c").unwrap();

        assert_eq!(store.max_id(), Some(NodeId(7)));
    }

    #[test]
    fn test_store_reopen_scans_objects() {
        let dir = tempdir().unwrap();

        {
            let store = ObjectStore::open(dir.path(), true).unwrap();
            store.put(NodeId(10), b"persisted").unwrap();
            store.put(NodeId(11), b"also persisted").unwrap();
        }

        let store = ObjectStore::open(dir.path(), true).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.max_id(), Some(NodeId(11)));
        assert_eq!(store.get(NodeId(10)).unwrap(), b"persisted");
    }

    #[test]
    fn test_store_ignores_foreign_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("README.txt"), b"not an object").unwrap();
        std::fs::write(dir.path().join("zzzz.node"), b"bad stem").unwrap();
        std::fs::write(dir.path().join("00ff.node"), b"good stem").unwrap();

        let store = ObjectStore::open(dir.path(), false).unwrap();
        // Only hex stems with the object extension are scanned
        assert_eq!(store.len(), 1);
        assert!(store.contains(NodeId(0xff)));
    }
}
