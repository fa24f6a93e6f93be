//! In-memory store, used for `*_db_in_memory` options and tests.
use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::anyhow;

use crate::store::{BatchOp, KvStore, WriteBatch};

/// Ordered map behind a lock. Contents vanish on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let data = self.data.read().map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let mut data = self.data.write().map_err(|_| anyhow!("memory store lock poisoned"))?;
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        let mut data = self.data.write().map_err(|_| anyhow!("memory store lock poisoned"))?;
        data.remove(key);
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> anyhow::Result<()> {
        let mut data = self.data.write().map_err(|_| anyhow!("memory store lock poisoned"))?;
        for op in batch.operations {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.read().map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn clear(&self) -> anyhow::Result<()> {
        let mut data = self.data.write().map_err(|_| anyhow!("memory store lock poisoned"))?;
        data.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn behaves_like_a_store() {
        crate::store::exercise_store(&MemoryStore::new());
    }
}
