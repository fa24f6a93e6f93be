mod common;

use std::io::Write;
use std::path::{Path, PathBuf};

use bitcoin::Block;
use blocktree_kernel::codec;
use blocktree_kernel::prelude::*;
use common::{genesis_header, in_memory, mine, mine_chain, regtest, Event};
use tempfile::tempdir;

/// Write `blocks` as a bootstrap file: magic, length, payload, with some
/// padding between records.
fn write_bootstrap(path: &Path, magic: [u8; 4], blocks: &[Block]) -> PathBuf {
    let mut file = std::fs::File::create(path).unwrap();
    for block in blocks {
        let payload = codec::encode(block);
        file.write_all(&magic).unwrap();
        file.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
        file.write_all(&payload).unwrap();
        file.write_all(&[0u8; 3]).unwrap();
    }
    path.to_path_buf()
}

#[test]
fn shuffled_bootstrap_file_imports_completely() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, events) = regtest();
    let magic = ctx.chain_params().magic();

    let mut blocks = mine_chain(&genesis_header(&ctx), 0, 6, 0);
    blocks.reverse();
    blocks.swap(1, 4);
    let file = write_bootstrap(&dir.path().join("bootstrap.dat"), magic, &blocks);

    let manager = in_memory(&ctx, &dir.path().join("node"));
    events.clear();
    let stats = manager.import_blocks(&[file])?;
    assert_eq!(stats.blocks_read, 6);
    assert_eq!(stats.blocks_accepted, 6);
    assert_eq!(stats.orphans_left, 0);
    assert_eq!(manager.tip_height()?, 6);
    assert!(events
        .events()
        .contains(&Event::Progress("Importing blocks".into(), 100)));
    Ok(())
}

#[test]
fn bad_records_are_skipped_and_missing_parents_reported() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, _) = regtest();
    let magic = ctx.chain_params().magic();

    let chain = mine_chain(&genesis_header(&ctx), 0, 3, 0);
    // Invalid: overpaying coinbase, still well formed.
    let mut bad = mine(&chain[2].header, 4, 0, Vec::new());
    bad.txdata[0].output[0].value = bitcoin::Amount::from_int_btc(60);
    bad.header.merkle_root = bad.compute_merkle_root().unwrap();
    bad.header = common::grind(bad.header);
    // A block whose parent never shows up.
    let stray_parent = mine(&chain[2].header, 4, 7, Vec::new());
    let stray = mine(&stray_parent.header, 5, 7, Vec::new());

    let path = dir.path().join("mixed.dat");
    write_bootstrap(&path, magic, &[chain[0].clone(), stray, chain[1].clone(), chain[2].clone(), bad]);
    // Garbage record with valid framing but undecodable payload.
    let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
    file.write_all(&magic)?;
    file.write_all(&4u32.to_le_bytes())?;
    file.write_all(&[1, 2, 3, 4])?;
    drop(file);

    let manager = in_memory(&ctx, &dir.path().join("node"));
    let stats = manager.import_blocks(&[path])?;
    assert_eq!(stats.blocks_read, 5);
    assert_eq!(stats.blocks_accepted, 3);
    assert_eq!(stats.blocks_skipped, 2, "the invalid block and the garbage record");
    assert_eq!(stats.orphans_left, 1);
    assert_eq!(manager.tip_height()?, 3);
    Ok(())
}

#[test]
fn unreadable_file_aborts_the_import() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, _) = regtest();
    let manager = in_memory(&ctx, dir.path());
    let err = manager
        .import_blocks(&[dir.path().join("does-not-exist.dat")])
        .unwrap_err();
    assert!(err.is_io(), "{err}");
    Ok(())
}

#[test]
fn interrupt_stops_between_records() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (ctx, _) = regtest();
    let blocks = mine_chain(&genesis_header(&ctx), 0, 2, 0);
    let file = write_bootstrap(&dir.path().join("b.dat"), ctx.chain_params().magic(), &blocks);

    let manager = in_memory(&ctx, &dir.path().join("node"));
    ctx.interrupt();
    assert!(matches!(manager.import_blocks(&[file]), Err(KernelError::Cancelled)));
    ctx.reset_interrupt();
    assert_eq!(manager.tip_height()?, 0);
    Ok(())
}
