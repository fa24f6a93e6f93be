//! Persistence interfaces and implementations used by the engine
//! (block tree records, coins, markers like the best block and reindex flag).

/// Minimal key-value interface. Keys and values are opaque bytes; the engine
/// owns the layout.
pub trait KvStore: Send + Sync {
    /// Value stored under `key`.
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;

    /// Insert or overwrite `key`.
    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;

    /// Remove `key` (no error if absent).
    fn delete(&self, key: &[u8]) -> anyhow::Result<()>;

    /// Apply every operation of `batch` or none of them.
    fn write_batch(&self, batch: WriteBatch) -> anyhow::Result<()>;

    /// All pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Remove everything.
    fn clear(&self) -> anyhow::Result<()>;
}

/// Write operations applied atomically by [`KvStore::write_batch`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    /// Operations in order.
    pub operations: Vec<BatchOp>,
}

/// One operation in a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite.
    Put {
        /// Key.
        key: Vec<u8>,
        /// Value.
        value: Vec<u8>,
    },
    /// Remove.
    Delete {
        /// Key.
        key: Vec<u8>,
    },
}

impl WriteBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a put.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.operations.push(BatchOp::Put { key, value });
    }

    /// Queue a delete.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.operations.push(BatchOp::Delete { key });
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

// submodules / concrete stores live here
pub mod memory_store;
pub use memory_store::MemoryStore;

#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;

#[cfg(test)]
pub(crate) fn exercise_store(store: &dyn KvStore) {
    store.put(b"a1", b"one").unwrap();
    store.put(b"a2", b"two").unwrap();
    store.put(b"b1", b"three").unwrap();
    assert_eq!(store.get(b"a1").unwrap(), Some(b"one".to_vec()));
    assert_eq!(store.get(b"zz").unwrap(), None);

    store.put(b"a1", b"uno").unwrap();
    assert_eq!(store.get(b"a1").unwrap(), Some(b"uno".to_vec()));

    let mut batch = WriteBatch::new();
    batch.delete(b"a2".to_vec());
    batch.put(b"a3".to_vec(), b"tres".to_vec());
    assert_eq!(batch.len(), 2);
    store.write_batch(batch).unwrap();

    let scanned = store.scan_prefix(b"a").unwrap();
    assert_eq!(
        scanned,
        vec![
            (b"a1".to_vec(), b"uno".to_vec()),
            (b"a3".to_vec(), b"tres".to_vec())
        ]
    );

    store.delete(b"b1").unwrap();
    store.delete(b"b1").unwrap();
    assert_eq!(store.get(b"b1").unwrap(), None);

    store.clear().unwrap();
    assert!(store.scan_prefix(b"").unwrap().is_empty());
}
