mod common;

use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::hashes::Hash as _;
use bitcoin::{block::Version, BlockHash, CompactTarget};
use blocktree_kernel::prelude::*;
use blocktree_kernel::FailureReason;
use common::{child_header, genesis_header, grind, grind_invalid, in_memory, mine_chain, regtest, Event};
use tempfile::tempdir;

fn now() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32
}

#[test]
fn unknown_parent_is_missing_prev_and_not_inserted() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, _) = regtest();
    let manager = in_memory(&ctx, dir.path());

    let mut header = child_header(&genesis_header(&ctx));
    header.prev_blockhash = BlockHash::from_byte_array([7u8; 32]);
    let header = grind(header);

    let state = manager.process_block_header(&header)?;
    assert_eq!(state.result(), BlockValidationResult::MissingPrev);
    assert_eq!(state.reject_reason(), "prev-blk-not-found");
    let guard = manager.read()?;
    assert!(guard.get_by_hash(&header.block_hash()).is_none());
    assert_eq!(guard.index().len(), 1);
    Ok(())
}

#[test]
fn future_timestamp_is_rejected_but_not_cached() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, _) = regtest();
    let manager = in_memory(&ctx, dir.path());

    let mut header = child_header(&genesis_header(&ctx));
    header.time = now() + 3 * 60 * 60;
    let header = grind(header);

    let state = manager.process_block_header(&header)?;
    assert_eq!(state.result(), BlockValidationResult::TimeFuture);
    assert_eq!(state.reject_reason(), "time-too-new");
    assert!(manager.read()?.get_by_hash(&header.block_hash()).is_none());

    let again = manager.process_block_header(&header)?;
    assert_eq!(again.result(), BlockValidationResult::TimeFuture);
    Ok(())
}

#[test]
fn bad_proof_of_work_is_cached() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, _) = regtest();
    let manager = in_memory(&ctx, dir.path());

    let header = grind_invalid(child_header(&genesis_header(&ctx)));
    let state = manager.process_block_header(&header)?;
    assert_eq!(state.result(), BlockValidationResult::InvalidHeader);
    assert_eq!(state.reject_reason(), "high-hash");

    {
        let guard = manager.read()?;
        let entry = guard.get_by_hash(&header.block_hash()).expect("cached failure");
        assert_eq!(
            entry.status(),
            BlockStatus::Failed(FailureReason::Invalid(BlockValidationResult::InvalidHeader))
        );
        assert_eq!(guard.best_header().map(|e| e.height()), Some(0));
    }

    let again = manager.process_block_header(&header)?;
    assert_eq!(again.result(), BlockValidationResult::CachedInvalid);

    // Children of a failed header are refused without being indexed.
    let child = grind(child_header(&header));
    let state = manager.process_block_header(&child)?;
    assert_eq!(state.result(), BlockValidationResult::InvalidPrev);
    assert!(manager.read()?.get_by_hash(&child.block_hash()).is_none());
    Ok(())
}

#[test]
fn wrong_bits_and_old_versions_are_invalid_headers() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, _) = regtest();
    let manager = in_memory(&ctx, dir.path());
    let genesis = genesis_header(&ctx);

    let mut harder = child_header(&genesis);
    harder.bits = CompactTarget::from_consensus(0x203fffff);
    let state = manager.process_block_header(&grind(harder))?;
    assert_eq!(state.result(), BlockValidationResult::InvalidHeader);
    assert_eq!(state.reject_reason(), "bad-diffbits");

    let mut old = child_header(&genesis);
    old.version = Version::from_consensus(1);
    let state = manager.process_block_header(&grind(old))?;
    assert_eq!(state.result(), BlockValidationResult::InvalidHeader);
    assert!(state.reject_reason().starts_with("bad-version"), "{state}");

    let mut stale = child_header(&genesis);
    stale.time = genesis.time;
    let state = manager.process_block_header(&grind(stale))?;
    assert_eq!(state.reject_reason(), "time-too-old");
    Ok(())
}

#[test]
fn headers_advance_best_header_but_not_the_tip() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, events) = regtest();
    let manager = in_memory(&ctx, dir.path());
    events.clear();

    let blocks = mine_chain(&genesis_header(&ctx), 0, 3, 0);
    for block in &blocks {
        assert!(manager.process_block_header(&block.header)?.is_valid());
    }
    assert_eq!(
        events.events(),
        vec![Event::HeaderTip(1), Event::HeaderTip(2), Event::HeaderTip(3)]
    );

    let guard = manager.read()?;
    assert_eq!(guard.best_header().map(|e| e.height()), Some(3));
    assert_eq!(guard.chain().height(), 0);
    // Re-submitting a known header is a no-op.
    drop(guard);
    assert!(manager.process_block_header(&blocks[1].header)?.is_valid());
    assert_eq!(manager.read()?.index().len(), 4);
    Ok(())
}

#[test]
fn equal_work_headers_keep_the_first_seen() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, _) = regtest();
    let manager = in_memory(&ctx, dir.path());
    let genesis = genesis_header(&ctx);

    let first = mine_chain(&genesis, 0, 1, 1).remove(0);
    let second = mine_chain(&genesis, 0, 1, 2).remove(0);
    assert_ne!(first.block_hash(), second.block_hash());

    manager.process_block_header(&first.header)?;
    manager.process_block_header(&second.header)?;
    assert_eq!(
        manager.read()?.best_header().map(|e| e.block_hash()),
        Some(first.block_hash())
    );

    // Full blocks: the first one connected stays the tip.
    manager.process_block(&first)?;
    manager.process_block(&second)?;
    assert_eq!(manager.tip_hash()?, Some(first.block_hash()));
    Ok(())
}
