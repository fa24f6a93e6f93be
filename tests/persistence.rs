mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use blocktree_kernel::prelude::*;
use blocktree_kernel::{MemoryStore, SynchronizationState, WriteBatch};
use common::{coinbase_outpoint, genesis_header, mine_chain, on_disk, process_all, regtest, Event};
use tempfile::tempdir;

#[test]
fn chain_survives_restart() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, _) = regtest();
    let blocks = mine_chain(&genesis_header(&ctx), 0, 5, 0);
    {
        let manager = on_disk(&ctx, dir.path());
        process_all(&manager, &blocks);
        assert_eq!(manager.tip_height()?, 5);
    }

    let manager = on_disk(&ctx, dir.path());
    let guard = manager.read()?;
    assert_eq!(guard.chain().height(), 5);
    assert_eq!(guard.chain().tip().unwrap().block_hash(), blocks[4].block_hash());
    assert_eq!(guard.coins().len(), 5);
    assert!(guard.coins().get(&coinbase_outpoint(&blocks[2])).is_some());

    let entry = guard.chain().get(3).unwrap();
    assert_eq!(entry.status(), BlockStatus::ValidChain);
    assert_eq!(manager.read_block(entry)?, blocks[2]);
    assert!(manager.read_undo(entry)?.txs.is_empty());
    Ok(())
}

#[test]
fn wiping_the_chainstate_rebuilds_coins_from_block_files() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, _) = regtest();
    let blocks = mine_chain(&genesis_header(&ctx), 0, 4, 0);
    {
        let manager = on_disk(&ctx, dir.path());
        process_all(&manager, &blocks);
    }

    let options = ChainstateManagerOptions::new(&ctx, dir.path(), dir.path().join("blocks"))
        .with_wipe_dbs(false, true)?;
    let manager = ChainstateManager::new(options)?;
    assert_eq!(manager.tip_height()?, 4);
    assert_eq!(manager.read()?.coins().len(), 4);
    Ok(())
}

#[test]
fn full_wipe_reindexes_from_own_block_files() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, events) = regtest();
    let blocks = mine_chain(&genesis_header(&ctx), 0, 4, 0);
    {
        let manager = on_disk(&ctx, dir.path());
        process_all(&manager, &blocks);
    }
    let files_before = std::fs::read_dir(dir.path().join("blocks"))?.count();

    let options = ChainstateManagerOptions::new(&ctx, dir.path(), dir.path().join("blocks"))
        .with_wipe_dbs(true, true)?;
    let manager = ChainstateManager::new(options)?;
    assert_eq!(manager.tip_height()?, -1, "nothing connected until the reindex runs");

    events.clear();
    let stats = manager.import_blocks(&[])?;
    assert_eq!(stats.blocks_read, 5);
    assert_eq!(stats.blocks_accepted, 5);
    assert_eq!(manager.tip_height()?, 4);
    assert!(events
        .events()
        .iter()
        .any(|e| matches!(e, Event::Tip(SynchronizationState::InitReindex, ..))));
    assert!(events
        .events()
        .contains(&Event::Progress("Reindexing blocks".into(), 100)));
    drop(manager);

    // Positions were reused, nothing was appended to new files.
    assert_eq!(std::fs::read_dir(dir.path().join("blocks"))?.count(), files_before);

    // The reindex flag is gone: a plain reopen resumes at the same tip.
    let manager = on_disk(&ctx, dir.path());
    assert_eq!(manager.tip_height()?, 4);
    Ok(())
}

/// Block tree store that fails every write while `failing` is set.
struct FlakyStore {
    inner: MemoryStore,
    failing: Arc<AtomicBool>,
}

impl FlakyStore {
    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        Ok(())
    }
}

impl KvStore for FlakyStore {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }
    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.check()?;
        self.inner.put(key, value)
    }
    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.check()?;
        self.inner.delete(key)
    }
    fn write_batch(&self, batch: WriteBatch) -> anyhow::Result<()> {
        self.check()?;
        self.inner.write_batch(batch)
    }
    fn scan_prefix(&self, prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan_prefix(prefix)
    }
    fn clear(&self) -> anyhow::Result<()> {
        self.check()?;
        self.inner.clear()
    }
}

#[test]
fn repeated_flush_failures_become_fatal() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, events) = regtest();
    let failing = Arc::new(AtomicBool::new(false));
    let options = ChainstateManagerOptions::new(&ctx, dir.path(), dir.path().join("blocks"))
        .with_block_tree_store(Box::new(FlakyStore {
            inner: MemoryStore::new(),
            failing: failing.clone(),
        }))
        .with_chainstate_db_in_memory(true);
    let manager = ChainstateManager::new(options)?;

    let blocks = mine_chain(&genesis_header(&ctx), 0, 3, 0);
    failing.store(true, Ordering::SeqCst);

    assert!(manager.process_block_header(&blocks[0].header)?.is_valid());
    assert!(manager.process_block_header(&blocks[1].header)?.is_valid());
    assert_eq!(events.count(|e| *e == Event::FlushError), 2);
    assert_eq!(events.count(|e| *e == Event::Fatal), 0);

    assert!(matches!(
        manager.process_block_header(&blocks[2].header),
        Err(KernelError::Fatal(_))
    ));
    assert_eq!(events.count(|e| *e == Event::Fatal), 1);

    // The manager refuses further work.
    failing.store(false, Ordering::SeqCst);
    assert!(matches!(manager.process_block(&blocks[0]), Err(KernelError::Fatal(_))));
    Ok(())
}

#[test]
fn flush_recovers_after_a_transient_failure() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, events) = regtest();
    let failing = Arc::new(AtomicBool::new(false));
    let store = FlakyStore {
        inner: MemoryStore::new(),
        failing: failing.clone(),
    };
    let options = ChainstateManagerOptions::new(&ctx, dir.path(), dir.path().join("blocks"))
        .with_block_tree_store(Box::new(store))
        .with_chainstate_db_in_memory(true);
    let manager = ChainstateManager::new(options)?;
    let blocks = mine_chain(&genesis_header(&ctx), 0, 2, 0);

    failing.store(true, Ordering::SeqCst);
    manager.process_block_header(&blocks[0].header)?;
    failing.store(false, Ordering::SeqCst);
    process_all(&manager, &blocks);
    assert_eq!(events.count(|e| *e == Event::FlushError), 1);
    assert_eq!(manager.tip_height()?, 2);
    Ok(())
}
