#![cfg(feature = "runtime")]

mod common;

use blocktree_kernel::AsyncChainstate;
use common::{genesis_header, in_memory, mine_chain, regtest};
use tempfile::tempdir;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_handle_drives_the_engine() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, _) = regtest();
    let chainstate = AsyncChainstate::new(in_memory(&ctx, dir.path()));

    let blocks = mine_chain(&genesis_header(&ctx), 0, 3, 0);
    assert!(chainstate.process_block_header(blocks[0].header).await?.is_valid());
    for block in blocks.iter().cloned() {
        let outcome = chainstate.process_block(block).await?;
        assert!(outcome.state.is_valid());
    }

    let (height, hash) = chainstate.tip().await?.expect("tip");
    assert_eq!(height, 3);
    assert_eq!(hash, blocks[2].block_hash());
    assert_eq!(chainstate.manager().tip_height()?, 3);
    Ok(())
}

#[tokio::test]
async fn concurrent_submissions_end_on_the_same_tip() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, _) = regtest();
    let chainstate = AsyncChainstate::new(in_memory(&ctx, dir.path()));
    let blocks = mine_chain(&genesis_header(&ctx), 0, 4, 0);
    // Headers first, so blocks may arrive in any order.
    for block in &blocks {
        chainstate.process_block_header(block.header).await?;
    }

    let tasks: Vec<_> = blocks
        .iter()
        .cloned()
        .map(|block| {
            let handle = chainstate.clone();
            tokio::spawn(async move { handle.process_block(block).await })
        })
        .collect();
    for task in tasks {
        task.await??;
    }
    assert_eq!(chainstate.tip().await?.map(|(h, _)| h), Some(4));
    Ok(())
}
