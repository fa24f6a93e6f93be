//! Bulk ingestion of block files.
//!
//! A pending reindex replays the node's own `blk*.dat` files first, reusing
//! their positions; afterwards each external file is scanned for
//! magic-framed records and fed through block processing. Blocks arriving
//! before their parent are held until the parent is accepted.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use bitcoin::{consensus, Block, BlockHash};
use tracing::{debug, info, warn};

use crate::blockstore::{scan_records, FlatFilePos};
use crate::engine::ChainstateManager;
use crate::error::{KernelError, KernelResult, StoreError};
use crate::validation::BlockValidationResult;

/// Blocks waiting for their parent, keyed by the parent's hash.
#[derive(Default)]
struct Orphans {
    by_parent: HashMap<BlockHash, Vec<(Block, Option<FlatFilePos>)>>,
}

impl Orphans {
    fn hold(&mut self, block: Block, pos: Option<FlatFilePos>) {
        self.by_parent
            .entry(block.header.prev_blockhash)
            .or_default()
            .push((block, pos));
    }

    fn take_children(&mut self, parent: &BlockHash) -> Vec<(Block, Option<FlatFilePos>)> {
        self.by_parent.remove(parent).unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.by_parent.values().map(Vec::len).sum()
    }
}

/// Counters for one import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    /// Records decoded into blocks.
    pub blocks_read: usize,
    /// Blocks stored for the first time.
    pub blocks_accepted: usize,
    /// Records that failed to decode or blocks that were rejected.
    pub blocks_skipped: usize,
    /// Blocks still missing their parent when the run ended.
    pub orphans_left: usize,
}

impl ChainstateManager {
    /// Reindex if one is pending, then import every file in `paths`.
    ///
    /// Failing to open or read a file aborts the import; bad records and
    /// invalid blocks are logged and skipped.
    pub fn import_blocks(&self, paths: &[PathBuf]) -> KernelResult<ImportStats> {
        let mut stats = ImportStats::default();
        let mut orphans = Orphans::default();

        if self.reindex_pending()? {
            let files = self.block_store().scan_block_files()?;
            info!(target: "reindex", files = files.len(), "reindexing block files");
            for (n, (file_no, path)) in files.iter().enumerate() {
                self.import_file(path, Some(*file_no), &mut orphans, &mut stats)?;
                self.notify_progress("Reindexing blocks", percent(n + 1, files.len()));
            }
            self.finish_reindex()?;
        }

        for (n, path) in paths.iter().enumerate() {
            info!(target: "reindex", path = %path.display(), "importing block file");
            self.import_file(path, None, &mut orphans, &mut stats)?;
            self.notify_progress("Importing blocks", percent(n + 1, paths.len()));
        }

        stats.orphans_left = orphans.len();
        if stats.orphans_left > 0 {
            warn!(
                target: "reindex",
                orphans = stats.orphans_left,
                "import finished with blocks whose parent never arrived"
            );
        }
        info!(
            target: "reindex",
            read = stats.blocks_read,
            accepted = stats.blocks_accepted,
            skipped = stats.blocks_skipped,
            "import finished"
        );
        Ok(stats)
    }

    /// `own_file` is the file number when replaying our own storage, so
    /// accepted blocks are linked in place instead of written again.
    fn import_file(
        &self,
        path: &Path,
        own_file: Option<u32>,
        orphans: &mut Orphans,
        stats: &mut ImportStats,
    ) -> KernelResult<()> {
        let bytes = fs::read(path).map_err(StoreError::Io)?;
        let magic = self.context().chain_params().magic();

        for (offset, payload) in scan_records(&bytes, magic) {
            if self.context().is_interrupted() {
                return Err(KernelError::Cancelled);
            }
            let block: Block = match consensus::deserialize(payload) {
                Ok(block) => block,
                Err(e) => {
                    debug!(target: "reindex", path = %path.display(), offset, "undecodable record: {e}");
                    stats.blocks_skipped += 1;
                    continue;
                }
            };
            stats.blocks_read += 1;
            let pos = own_file.map(|file| FlatFilePos::new(file, offset));
            self.import_block(block, pos, orphans, stats)?;
        }
        Ok(())
    }

    fn import_block(
        &self,
        block: Block,
        pos: Option<FlatFilePos>,
        orphans: &mut Orphans,
        stats: &mut ImportStats,
    ) -> KernelResult<()> {
        let mut queue = vec![(block, pos)];
        while let Some((block, pos)) = queue.pop() {
            let hash = block.block_hash();
            let outcome = self.process_block_at(&block, pos)?;
            if outcome.state.result() == BlockValidationResult::MissingPrev {
                debug!(target: "reindex", %hash, "holding block until its parent arrives");
                orphans.hold(block, pos);
                continue;
            }
            if !outcome.state.is_valid() {
                debug!(target: "reindex", %hash, state = %outcome.state, "skipping block");
                stats.blocks_skipped += 1;
                continue;
            }
            if outcome.new_block {
                stats.blocks_accepted += 1;
            }
            queue.extend(orphans.take_children(&hash));
        }
        Ok(())
    }
}

fn percent(done: usize, total: usize) -> i32 {
    if total == 0 {
        return 100;
    }
    (done * 100 / total) as i32
}
