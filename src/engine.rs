//! Orchestrator for block validation:
//! 1) accept headers into the block tree,
//! 2) check and store full blocks,
//! 3) move the active chain to the most-work valid tip, maintaining coins
//!    and undo data along the way.
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use bitcoin::{block::Header, hashes::Hash, Block, BlockHash, OutPoint, Work};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::blockstore::{BlockStore, FlatFilePos};
use crate::coins::{coin_key, outpoint_from_key, BlockUndo, Coin, CoinsViewCache, UtxoSet, COIN_PREFIX};
use crate::context::Context;
use crate::error::{KernelError, KernelResult, StoreError};
use crate::index::{ActiveChain, BlockIndex, BlockStatus, ChainView, EntryId, EntryRef, FailureReason};
use crate::notifications::{SynchronizationState, Warning};
use crate::store::{KvStore, MemoryStore, WriteBatch};
use crate::validation::checks;
use crate::validation::script::verify_script;
use crate::validation::{
    BlockValidationResult, BlockValidationState, ScriptVerificationFlags, ScriptVerifier, TrustingVerifier,
};

/// Most script-check worker threads a manager will start.
pub const MAX_WORKER_THREADS: usize = 15;

const BLOCK_RECORD_PREFIX: u8 = b'b';
const REINDEX_KEY: &[u8] = b"R";
const BEST_BLOCK_KEY: &[u8] = b"B";

/// Consecutive failed index flushes tolerated before giving up.
const MAX_STORE_FAILURES: u32 = 3;
/// A tip older than this keeps the node in initial block download.
const MAX_TIP_AGE: u32 = 24 * 60 * 60;
/// Window and threshold for the unknown-version warning.
const UNKNOWN_VERSION_WINDOW: i32 = 100;
const UNKNOWN_VERSION_THRESHOLD: usize = 50;
const VERSIONBITS_TOP_MASK: i32 = 0xe000_0000_u32 as i32;
const VERSIONBITS_TOP_BITS: i32 = 0x2000_0000;
/// Invalid chains this many blocks ahead of the tip raise a warning.
const LARGE_WORK_BLOCKS: usize = 6;

/// Options for [`ChainstateManager::new`].
pub struct ChainstateManagerOptions {
    context: Context,
    data_dir: PathBuf,
    blocks_dir: PathBuf,
    worker_threads: usize,
    wipe_block_tree: bool,
    wipe_chainstate: bool,
    block_tree_in_memory: bool,
    chainstate_in_memory: bool,
    block_tree_store: Option<Box<dyn KvStore>>,
    chainstate_store: Option<Box<dyn KvStore>>,
    verifier: Arc<dyn ScriptVerifier>,
}

impl ChainstateManagerOptions {
    /// Databases go in `data_dir`, flat block files in `blocks_dir`. Both are
    /// created if missing.
    pub fn new(context: &Context, data_dir: impl Into<PathBuf>, blocks_dir: impl Into<PathBuf>) -> Self {
        Self {
            context: context.clone(),
            data_dir: data_dir.into(),
            blocks_dir: blocks_dir.into(),
            worker_threads: 0,
            wipe_block_tree: false,
            wipe_chainstate: false,
            block_tree_in_memory: false,
            chainstate_in_memory: false,
            block_tree_store: None,
            chainstate_store: None,
            verifier: Arc::new(TrustingVerifier),
        }
    }

    /// Script-check worker threads, clamped to `0..=15`. Zero checks scripts
    /// on the calling thread.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.min(MAX_WORKER_THREADS);
        self
    }

    /// Wipe databases on startup. Wiping the block tree schedules a reindex
    /// from the block files and requires wiping the chainstate too.
    pub fn with_wipe_dbs(mut self, block_tree: bool, chainstate: bool) -> KernelResult<Self> {
        if block_tree && !chainstate {
            return Err(KernelError::InvalidOptions(
                "wiping the block tree db without also wiping the chainstate db is not supported".into(),
            ));
        }
        self.wipe_block_tree = block_tree;
        self.wipe_chainstate = chainstate;
        Ok(self)
    }

    /// Keep the block tree database in memory.
    pub fn with_block_tree_db_in_memory(mut self, in_memory: bool) -> Self {
        self.block_tree_in_memory = in_memory;
        self
    }

    /// Keep the chainstate database in memory.
    pub fn with_chainstate_db_in_memory(mut self, in_memory: bool) -> Self {
        self.chainstate_in_memory = in_memory;
        self
    }

    /// Use a caller-provided block tree database.
    pub fn with_block_tree_store(mut self, store: Box<dyn KvStore>) -> Self {
        self.block_tree_store = Some(store);
        self
    }

    /// Use a caller-provided chainstate database.
    pub fn with_chainstate_store(mut self, store: Box<dyn KvStore>) -> Self {
        self.chainstate_store = Some(store);
        self
    }

    /// Script interpreter used when connecting blocks. Defaults to
    /// [`TrustingVerifier`].
    pub fn with_script_verifier(mut self, verifier: Arc<dyn ScriptVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Directory holding the databases.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory holding the block files.
    pub fn blocks_dir(&self) -> &Path {
        &self.blocks_dir
    }
}

impl fmt::Debug for ChainstateManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainstateManagerOptions")
            .field("data_dir", &self.data_dir)
            .field("blocks_dir", &self.blocks_dir)
            .field("worker_threads", &self.worker_threads)
            .field("wipe_block_tree", &self.wipe_block_tree)
            .field("wipe_chainstate", &self.wipe_chainstate)
            .field("block_tree_in_memory", &self.block_tree_in_memory)
            .field("chainstate_in_memory", &self.chainstate_in_memory)
            .finish()
    }
}

/// Result of [`ChainstateManager::process_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessBlockOutcome {
    /// The block reached `ValidTree` for the first time during this call.
    pub new_block: bool,
    /// Validation result for this block.
    pub state: BlockValidationState,
}

pub(crate) struct ChainState {
    pub(crate) index: BlockIndex,
    pub(crate) chain: ActiveChain,
    pub(crate) coins: UtxoSet,
    pub(crate) reindexing: bool,
    ibd_done: bool,
    store_failures: u32,
    fatal: Option<String>,
    warnings: HashSet<Warning>,
}

/// Point-in-time read access to the block tree, active chain and coins.
/// Mutation waits until the guard is dropped.
pub struct ChainstateReadGuard<'a> {
    guard: RwLockReadGuard<'a, ChainState>,
}

impl ChainstateReadGuard<'_> {
    /// The block tree.
    pub fn index(&self) -> &BlockIndex {
        &self.guard.index
    }

    /// The active chain.
    pub fn chain(&self) -> ChainView<'_> {
        ChainView::new(&self.guard.chain, &self.guard.index)
    }

    /// The unspent output set at the tip.
    pub fn coins(&self) -> &UtxoSet {
        &self.guard.coins
    }

    /// Entry for `hash`.
    pub fn get_by_hash(&self, hash: &BlockHash) -> Option<EntryRef<'_>> {
        self.guard.index.get_by_hash(hash)
    }

    /// Highest-work valid header.
    pub fn best_header(&self) -> Option<EntryRef<'_>> {
        self.guard
            .index
            .best_header()
            .and_then(|id| self.guard.index.get(id))
    }
}

enum ScriptOutcome {
    Valid,
    Invalid(String),
    /// The oracle refused to run.
    Error(String),
    Cancelled,
}

/// The validation engine. Owns the block tree, the active chain, the coins
/// and both databases.
pub struct ChainstateManager {
    context: Context,
    state: RwLock<ChainState>,
    blocks: BlockStore,
    block_tree_db: Box<dyn KvStore>,
    chainstate_db: Box<dyn KvStore>,
    verifier: Arc<dyn ScriptVerifier>,
    pool: Option<rayon::ThreadPool>,
}

fn open_store(
    provided: Option<Box<dyn KvStore>>,
    in_memory: bool,
    path: PathBuf,
) -> KernelResult<Box<dyn KvStore>> {
    if let Some(store) = provided {
        return Ok(store);
    }
    if in_memory {
        return Ok(Box::new(MemoryStore::new()));
    }
    #[cfg(feature = "store-sqlite")]
    {
        Ok(Box::new(crate::store::SqliteStore::new(path)?))
    }
    #[cfg(not(feature = "store-sqlite"))]
    {
        Err(KernelError::InvalidOptions(format!(
            "no on-disk database backend for {}; enable `store-sqlite` or use an in-memory db",
            path.display()
        )))
    }
}

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn record_key(id: EntryId) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(BLOCK_RECORD_PREFIX);
    key.extend_from_slice(&id.sequence().to_be_bytes());
    key
}

impl ChainstateManager {
    /// Open (or create) the databases and block files, restore the block
    /// tree and active chain, and reconnect any blocks the chainstate is
    /// missing.
    pub fn new(options: ChainstateManagerOptions) -> KernelResult<Self> {
        let ChainstateManagerOptions {
            context,
            data_dir,
            blocks_dir,
            worker_threads,
            wipe_block_tree,
            wipe_chainstate,
            block_tree_in_memory,
            chainstate_in_memory,
            block_tree_store,
            chainstate_store,
            verifier,
        } = options;

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("create data dir {}", data_dir.display()))?;
        let block_tree_db = open_store(block_tree_store, block_tree_in_memory, data_dir.join("blocktree.sqlite"))?;
        let chainstate_db = open_store(chainstate_store, chainstate_in_memory, data_dir.join("chainstate.sqlite"))?;
        let blocks = BlockStore::open(&blocks_dir, context.chain_params().magic())?;

        if wipe_block_tree {
            info!(target: "kernel", "wiping block tree db, reindex scheduled");
            block_tree_db.clear().context("wipe block tree db")?;
            block_tree_db.put(REINDEX_KEY, &[1]).context("set reindex flag")?;
        }
        if wipe_chainstate {
            info!(target: "kernel", "wiping chainstate db");
            chainstate_db.clear().context("wipe chainstate db")?;
        }

        let pool = if worker_threads > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(worker_threads)
                    .thread_name(|i| format!("scriptcheck.{i}"))
                    .build()
                    .map_err(|e| KernelError::Internal(format!("script check pool: {e}")))?,
            )
        } else {
            None
        };

        let records = block_tree_db
            .scan_prefix(&[BLOCK_RECORD_PREFIX])
            .context("load block index records")?
            .into_iter()
            .filter_map(|(key, value)| {
                let seq: [u8; 4] = key.get(1..5)?.try_into().ok()?;
                Some((u32::from_be_bytes(seq), value))
            })
            .collect();
        let index = BlockIndex::from_records(records)?;
        info!(target: "kernel", entries = index.len(), "loaded block index");

        let mut reindexing = block_tree_db.get(REINDEX_KEY).context("read reindex flag")?.is_some();
        if reindexing && blocks.scan_block_files()?.is_empty() {
            block_tree_db.delete(REINDEX_KEY).context("clear reindex flag")?;
            reindexing = false;
        }

        let manager = Self {
            context,
            state: RwLock::new(ChainState {
                index,
                chain: ActiveChain::new(),
                coins: UtxoSet::new(),
                reindexing,
                ibd_done: false,
                store_failures: 0,
                fatal: None,
                warnings: HashSet::new(),
            }),
            blocks,
            block_tree_db,
            chainstate_db,
            verifier,
            pool,
        };

        {
            let mut st = manager.write()?;
            manager.ensure_genesis(&mut st, !reindexing)?;
            manager.restore_chain(&mut st)?;
            if !reindexing {
                manager.activate_best_chain(&mut st, None)?;
            }
            manager.flush_index(&mut st)?;
        }
        Ok(manager)
    }

    /// The context this manager reports through.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Flat-file block storage.
    pub fn block_store(&self) -> &BlockStore {
        &self.blocks
    }

    /// Shared read access to the current state.
    pub fn read(&self) -> KernelResult<ChainstateReadGuard<'_>> {
        let guard = self
            .state
            .read()
            .map_err(|_| KernelError::Internal("chainstate lock poisoned".into()))?;
        Ok(ChainstateReadGuard { guard })
    }

    pub(crate) fn write(&self) -> KernelResult<RwLockWriteGuard<'_, ChainState>> {
        let st = self
            .state
            .write()
            .map_err(|_| KernelError::Internal("chainstate lock poisoned".into()))?;
        if let Some(msg) = &st.fatal {
            return Err(KernelError::Fatal(msg.clone()));
        }
        Ok(st)
    }

    fn ensure_genesis(&self, st: &mut ChainState, with_data: bool) -> KernelResult<()> {
        let params = self.context.chain_params();
        let genesis = params.genesis_block();
        let hash = genesis.block_hash();

        if let Some(first) = st.index.get(EntryId::first()) {
            if first.block_hash() != hash {
                return Err(KernelError::InvalidOptions(format!(
                    "block tree starts at {} but network genesis is {hash}",
                    first.block_hash()
                )));
            }
        }

        let id = match st.index.lookup(&hash) {
            Some(id) => id,
            None => {
                let id = st.index.insert(genesis.header)?;
                st.index.mark_status(id, BlockStatus::HeaderOnly)?;
                id
            }
        };
        if with_data && st.index.e(id).data_pos.is_none() {
            let pos = self.blocks.write_block(genesis)?;
            st.index.set_data_pos(id, pos, genesis.txdata.len() as u32);
        }
        if st.index.e(id).data_pos.is_some() && !st.index.status(id).is_at_least(BlockStatus::ValidTree) {
            st.index.mark_status(id, BlockStatus::ValidTree)?;
        }
        Ok(())
    }

    /// Point the chain at the persisted best block and load the coins.
    fn restore_chain(&self, st: &mut ChainState) -> KernelResult<()> {
        let best = self.chainstate_db.get(BEST_BLOCK_KEY).context("read best block")?;
        let Some(raw) = best else {
            return Ok(());
        };
        let tip = <[u8; 32]>::try_from(raw.as_slice())
            .ok()
            .map(BlockHash::from_byte_array)
            .and_then(|hash| st.index.lookup(&hash));
        let Some(tip) = tip else {
            warn!(target: "coindb", "persisted best block unknown to the block tree, rebuilding chainstate");
            self.chainstate_db.clear().context("reset chainstate db")?;
            return Ok(());
        };

        for (key, value) in self.chainstate_db.scan_prefix(&[COIN_PREFIX]).context("load coins")? {
            let Some(outpoint) = outpoint_from_key(&key) else {
                return Err(StoreError::CorruptData(format!("coin key {}", hex::encode(&key))).into());
            };
            st.coins.insert(outpoint, Coin::decode(&value)?);
        }
        st.chain.set_tip(&st.index, Some(tip));
        st.index.prune_candidates(tip);
        info!(
            target: "coindb",
            height = st.chain.height(),
            coins = st.coins.len(),
            "restored chainstate"
        );
        Ok(())
    }

    /// Validate `header` and add it to the block tree.
    pub fn process_block_header(&self, header: &Header) -> KernelResult<BlockValidationState> {
        let mut st = self.write()?;
        let (state, _) = self.accept_header(&mut st, header)?;
        self.flush_index(&mut st)?;
        Ok(state)
    }

    /// Validate and store `block`, then move the active chain to the best
    /// valid tip.
    ///
    /// A returned error means processing could not complete; validity is
    /// reported in [`ProcessBlockOutcome::state`].
    pub fn process_block(&self, block: &Block) -> KernelResult<ProcessBlockOutcome> {
        self.process_block_at(block, None)
    }

    /// [`process_block`](Self::process_block) for a block already stored at
    /// `known_pos`.
    pub(crate) fn process_block_at(
        &self,
        block: &Block,
        known_pos: Option<FlatFilePos>,
    ) -> KernelResult<ProcessBlockOutcome> {
        let mut st = self.write()?;
        let outcome = self.accept_block(&mut st, block, known_pos);
        let flushed = self.flush_index(&mut st);
        let outcome = outcome?;
        flushed?;
        Ok(outcome)
    }

    fn accept_header(
        &self,
        st: &mut ChainState,
        header: &Header,
    ) -> KernelResult<(BlockValidationState, Option<EntryId>)> {
        let hash = header.block_hash();
        if let Some(id) = st.index.lookup(&hash) {
            if st.index.status(id).is_failed() {
                return Ok((
                    BlockValidationState::invalid(BlockValidationResult::CachedInvalid, "duplicate-invalid"),
                    Some(id),
                ));
            }
            return Ok((BlockValidationState::valid(), Some(id)));
        }

        let Some(parent) = st.index.lookup(&header.prev_blockhash) else {
            debug!(target: "validation", %hash, prev = %header.prev_blockhash, "header parent unknown");
            return Ok((
                BlockValidationState::invalid(BlockValidationResult::MissingPrev, "prev-blk-not-found"),
                None,
            ));
        };
        if st.index.status(parent).is_failed() {
            return Ok((
                BlockValidationState::invalid(BlockValidationResult::InvalidPrev, "bad-prevblk"),
                None,
            ));
        }

        let params = self.context.chain_params();
        if let Err(state) = checks::check_header(params, &st.index, parent, header, now()) {
            debug!(target: "validation", %hash, %state, "header rejected");
            if state.result() != BlockValidationResult::TimeFuture {
                let id = st.index.insert(*header)?;
                st.index
                    .mark_status(id, BlockStatus::Failed(FailureReason::Invalid(state.result())))?;
                self.update_invalid_chain_warning(st, id);
            }
            return Ok((state, None));
        }

        let id = st.index.insert(*header)?;
        st.index.mark_status(id, BlockStatus::HeaderOnly)?;
        if st.index.best_header() == Some(id) {
            let sync = self.sync_state(st);
            let entry = st.index.e(id);
            self.context
                .notifications()
                .header_tip(sync, entry.height, entry.header.time, false);
        }
        Ok((BlockValidationState::valid(), Some(id)))
    }

    fn accept_block(
        &self,
        st: &mut ChainState,
        block: &Block,
        known_pos: Option<FlatFilePos>,
    ) -> KernelResult<ProcessBlockOutcome> {
        let hash = block.block_hash();
        if let Some(id) = st.index.lookup(&hash) {
            if st.index.status(id).is_at_least(BlockStatus::ValidTree) {
                // A previous call may have been interrupted before switching.
                self.activate_best_chain(st, Some(block))?;
                return Ok(ProcessBlockOutcome {
                    new_block: false,
                    state: BlockValidationState::valid(),
                });
            }
        }

        let validation = self.context.validation_interface();
        let (header_state, id) = self.accept_header(st, &block.header)?;
        let id = match id {
            Some(id) if header_state.is_valid() => id,
            _ => {
                validation.block_checked(block, &header_state);
                return Ok(ProcessBlockOutcome {
                    new_block: false,
                    state: header_state,
                });
            }
        };

        let params = self.context.chain_params();
        let parent = st.index.prev(id);
        let height = st.index.e(id).height;
        let parent_mtp = parent.map(|p| st.index.median_time_past(p)).unwrap_or(0);
        let checked = checks::check_block(block)
            .and_then(|_| checks::check_block_contextual(params, block, height, parent_mtp));
        if let Err(state) = checked {
            debug!(target: "validation", %hash, %state, "block rejected");
            if state.result() != BlockValidationResult::Mutated {
                st.index
                    .mark_status(id, BlockStatus::Failed(FailureReason::Invalid(state.result())))?;
                self.update_invalid_chain_warning(st, id);
            }
            validation.block_checked(block, &state);
            return Ok(ProcessBlockOutcome {
                new_block: false,
                state,
            });
        }

        if parent.is_some() && parent == st.chain.tip() {
            if let Some(entry) = st.index.get(id) {
                validation.pow_valid_block(block, entry);
            }
        }

        let pos = match known_pos {
            Some(pos) => pos,
            None => self.blocks.write_block(block)?,
        };
        st.index.set_data_pos(id, pos, block.txdata.len() as u32);
        st.index.mark_status(id, BlockStatus::ValidTree)?;

        let failures = self.activate_best_chain(st, Some(block))?;
        let state = failures
            .into_iter()
            .find(|(failed, _)| *failed == id)
            .map(|(_, state)| state)
            .unwrap_or_default();
        Ok(ProcessBlockOutcome {
            new_block: true,
            state,
        })
    }

    /// Switch to the most-work candidate until none beats the tip. Returns
    /// the blocks that failed to connect on the way.
    fn activate_best_chain(
        &self,
        st: &mut ChainState,
        hint: Option<&Block>,
    ) -> KernelResult<Vec<(EntryId, BlockValidationState)>> {
        let mut failures = Vec::new();
        loop {
            if self.context.is_interrupted() {
                return Err(KernelError::Cancelled);
            }
            let Some(candidate) = st.index.most_work_candidate() else {
                break;
            };
            if let Some(tip) = st.chain.tip() {
                if st.index.e(candidate).chain_work <= st.index.e(tip).chain_work {
                    break;
                }
            }

            let old_tip = st.chain.tip();
            let mut stop = false;
            if let Some(failure) = self.switch_to(st, candidate, hint)? {
                // An internal error leaves the candidate in place; retrying
                // now would fail the same way.
                stop = failure.1.is_error();
                failures.push(failure);
            }
            if st.chain.tip() != old_tip {
                self.notify_tip(st);
            }
            if stop {
                break;
            }
        }
        Ok(failures)
    }

    fn switch_to(
        &self,
        st: &mut ChainState,
        target: EntryId,
        hint: Option<&Block>,
    ) -> KernelResult<Option<(EntryId, BlockValidationState)>> {
        let fork = st.chain.find_fork(&st.index, target);

        let mut disconnected = Vec::new();
        while st.chain.tip() != fork {
            if self.context.is_interrupted() {
                return Err(KernelError::Cancelled);
            }
            if let Some(tip) = st.chain.tip() {
                disconnected.push(tip);
            }
            self.disconnect_tip(st)?;
        }

        let mut path = Vec::new();
        let mut cur = Some(target);
        while cur != fork {
            let Some(id) = cur else { break };
            path.push(id);
            cur = st.index.prev(id);
        }
        path.reverse();
        if !disconnected.is_empty() {
            info!(
                target: "validation",
                disconnect = disconnected.len(),
                connect = path.len(),
                "reorganizing active chain"
            );
        }

        for id in path {
            if self.context.is_interrupted() {
                return Err(KernelError::Cancelled);
            }
            let Err(state) = self.connect_tip(st, id, hint)? else {
                continue;
            };

            warn!(
                target: "validation",
                hash = %st.index.e(id).hash,
                %state,
                "block failed to connect"
            );
            if !state.is_error() {
                st.index
                    .mark_status(id, BlockStatus::Failed(FailureReason::Invalid(state.result())))?;
                self.update_invalid_chain_warning(st, id);
            }

            while st.chain.tip() != fork {
                self.disconnect_tip(st)?;
            }
            for old in disconnected.into_iter().rev() {
                if let Err(old_state) = self.connect_tip(st, old, None)? {
                    if !old_state.is_error() {
                        st.index
                            .mark_status(old, BlockStatus::Failed(FailureReason::Invalid(old_state.result())))?;
                    }
                    break;
                }
            }
            return Ok(Some((id, state)));
        }
        Ok(None)
    }

    fn load_block(&self, st: &mut ChainState, id: EntryId, hint: Option<&Block>) -> KernelResult<Block> {
        let entry = st.index.e(id);
        if let Some(block) = hint.filter(|b| b.block_hash() == entry.hash) {
            return Ok(block.clone());
        }
        let Some(pos) = entry.data_pos else {
            let msg = format!("block {} has no stored data", entry.hash);
            return Err(self.fatal(st, msg));
        };
        match self.blocks.read_block(pos) {
            Ok(block) => Ok(block),
            Err(e) => {
                let msg = format!("failed to read block {}: {e}", entry.hash);
                Err(self.fatal(st, msg))
            }
        }
    }

    /// Connect `id` on top of the current tip. The outer result carries
    /// system failures, the inner one the block's validity.
    fn connect_tip(
        &self,
        st: &mut ChainState,
        id: EntryId,
        hint: Option<&Block>,
    ) -> KernelResult<Result<(), BlockValidationState>> {
        let started = Instant::now();
        let block = self.load_block(st, id, hint)?;
        let params = self.context.chain_params();
        let (hash, height, data_pos, has_undo) = {
            let e = st.index.e(id);
            (e.hash, e.height, e.data_pos, e.undo_pos.is_some())
        };
        let validation = self.context.validation_interface();

        let mut batch = WriteBatch::new();
        let changes = if height == 0 {
            Default::default()
        } else {
            let mut view = CoinsViewCache::new(&st.coins);
            let undo = match checks::connect_coins(params, &block, height, &mut view) {
                Ok(undo) => undo,
                Err(state) => {
                    validation.block_checked(&block, &state);
                    return Ok(Err(state));
                }
            };
            let changes = view.into_changes();

            if let Err(state) = self.run_script_checks(&block, &undo, params.script_flags_at(height))? {
                validation.block_checked(&block, &state);
                return Ok(Err(state));
            }

            if !has_undo {
                let written = data_pos
                    .ok_or_else(|| StoreError::NotFound(format!("data position of {hash}")))
                    .and_then(|pos| self.blocks.write_undo(pos, &hash, &undo));
                match written {
                    Ok(undo_pos) => st.index.set_undo_pos(id, undo_pos),
                    Err(e) => {
                        let msg = format!("failed to write undo for {hash}: {e}");
                        return Err(self.fatal(st, msg));
                    }
                }
            }
            changes
        };

        for (outpoint, change) in &changes {
            match change {
                Some(coin) => batch.put(coin_key(outpoint), coin.encode()),
                None => batch.delete(coin_key(outpoint)),
            }
        }
        batch.put(BEST_BLOCK_KEY.to_vec(), hash.to_byte_array().to_vec());

        if !st.index.status(id).is_at_least(BlockStatus::ValidChain) {
            st.index.mark_status(id, BlockStatus::ValidChain)?;
        }
        self.commit(st, batch, &hash)?;
        st.coins.apply(&changes);
        st.chain.set_tip(&st.index, Some(id));
        st.index.prune_candidates(id);

        validation.block_checked(&block, &BlockValidationState::valid());
        if let Some(entry) = st.index.get(id) {
            validation.block_connected(&block, entry);
        }
        debug!(
            target: "bench",
            %hash,
            height,
            txs = block.txdata.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "connected block"
        );
        Ok(Ok(()))
    }

    fn disconnect_tip(&self, st: &mut ChainState) -> KernelResult<()> {
        let Some(tip) = st.chain.tip() else {
            return Err(KernelError::Internal("disconnect with empty chain".into()));
        };
        let block = self.load_block(st, tip, None)?;
        let (hash, height, undo_pos, parent) = {
            let e = st.index.e(tip);
            (e.hash, e.height, e.undo_pos, e.parent)
        };

        let mut changes = Default::default();
        if height > 0 {
            let undo = match undo_pos.map(|pos| self.blocks.read_undo(pos, &hash)) {
                Some(Ok(undo)) => undo,
                Some(Err(e)) => {
                    let msg = format!("failed to read undo for {hash}: {e}");
                    return Err(self.fatal(st, msg));
                }
                None => {
                    let msg = format!("no undo data for connected block {hash}");
                    return Err(self.fatal(st, msg));
                }
            };
            let mut view = CoinsViewCache::new(&st.coins);
            if let Err(msg) = checks::disconnect_coins(&block, &undo, &mut view) {
                let msg = format!("inconsistent undo for {hash}: {msg}");
                return Err(self.fatal(st, msg));
            }
            changes = view.into_changes();
        }

        let mut batch = WriteBatch::new();
        for (outpoint, change) in &changes {
            match change {
                Some(coin) => batch.put(coin_key(outpoint), coin.encode()),
                None => batch.delete(coin_key(outpoint)),
            }
        }
        match parent {
            Some(p) => batch.put(BEST_BLOCK_KEY.to_vec(), st.index.e(p).hash.to_byte_array().to_vec()),
            None => batch.delete(BEST_BLOCK_KEY.to_vec()),
        }
        self.commit(st, batch, &hash)?;
        st.coins.apply(&changes);
        st.chain.set_tip(&st.index, parent);
        st.index.restore_candidate(tip);

        if let Some(entry) = st.index.get(tip) {
            self.context.validation_interface().block_disconnected(&block, entry);
        }
        debug!(target: "validation", %hash, height, "disconnected block");
        Ok(())
    }

    /// Persist dirty index records, then the coins batch. Either failing
    /// inside a chain switch leaves disk and memory out of step, so it is
    /// fatal.
    fn commit(&self, st: &mut ChainState, batch: WriteBatch, hash: &BlockHash) -> KernelResult<()> {
        let dirty = st.index.take_dirty();
        let records = self.index_batch(st, &dirty);
        let written = self
            .block_tree_db
            .write_batch(records)
            .and_then(|_| self.chainstate_db.write_batch(batch))
            .with_context(|| format!("commit chainstate for {hash}"));
        if let Err(e) = written {
            st.index.restore_dirty(&dirty);
            return Err(self.fatal(st, format!("{e:#}")));
        }
        debug!(target: "coindb", %hash, "committed chainstate");
        Ok(())
    }

    fn index_batch(&self, st: &ChainState, ids: &[EntryId]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for id in ids {
            batch.put(record_key(*id), st.index.encode_record(*id));
        }
        batch
    }

    /// Write dirty index records. Failures are reported through
    /// `flush_error` and retried on the next flush; several in a row are
    /// fatal.
    fn flush_index(&self, st: &mut ChainState) -> KernelResult<()> {
        let dirty = st.index.take_dirty();
        if dirty.is_empty() {
            return Ok(());
        }
        let batch = self.index_batch(st, &dirty);
        match self.block_tree_db.write_batch(batch) {
            Ok(()) => {
                st.store_failures = 0;
                debug!(target: "kvstore", records = dirty.len(), "flushed block index");
                Ok(())
            }
            Err(e) => {
                st.index.restore_dirty(&dirty);
                st.store_failures += 1;
                let msg = format!("failed to flush block index: {e:#}");
                warn!(target: "kvstore", failures = st.store_failures, "{msg}");
                self.context.notifications().flush_error(&msg);
                if st.store_failures >= MAX_STORE_FAILURES {
                    return Err(self.fatal(st, msg));
                }
                Ok(())
            }
        }
    }

    fn fatal(&self, st: &mut ChainState, msg: String) -> KernelError {
        error!(target: "kernel", "{msg}");
        self.context.notifications().fatal_error(&msg);
        st.fatal = Some(msg.clone());
        KernelError::Fatal(msg)
    }

    fn run_script_checks(
        &self,
        block: &Block,
        undo: &BlockUndo,
        flags: ScriptVerificationFlags,
    ) -> KernelResult<Result<(), BlockValidationState>> {
        let spent = checks::spent_outputs(undo);
        let jobs: Vec<(usize, usize)> = block
            .txdata
            .iter()
            .enumerate()
            .skip(1)
            .flat_map(|(t, tx)| (0..tx.input.len()).map(move |i| (t, i)))
            .collect();

        let check = |&(t, i): &(usize, usize)| -> ScriptOutcome {
            if self.context.is_interrupted() {
                return ScriptOutcome::Cancelled;
            }
            let tx = &block.txdata[t];
            let outputs = &spent[t - 1];
            let prev = &outputs[i];
            match verify_script(
                self.verifier.as_ref(),
                &prev.script_pubkey,
                prev.value,
                tx,
                i,
                outputs,
                flags,
            ) {
                Ok(true) => ScriptOutcome::Valid,
                Ok(false) => ScriptOutcome::Invalid(format!(
                    "input {i} of {} failed script verification",
                    tx.compute_txid()
                )),
                Err(e) => ScriptOutcome::Error(format!("input {i} of {}: {e}", tx.compute_txid())),
            }
        };

        let outcomes: Vec<ScriptOutcome> = match &self.pool {
            Some(pool) => pool.install(|| jobs.par_iter().map(&check).collect()),
            None => jobs.iter().map(&check).collect(),
        };

        let mut invalid = None;
        let mut internal = None;
        for outcome in outcomes {
            match outcome {
                ScriptOutcome::Valid => {}
                ScriptOutcome::Cancelled => return Err(KernelError::Cancelled),
                ScriptOutcome::Invalid(msg) => {
                    invalid.get_or_insert(msg);
                }
                ScriptOutcome::Error(msg) => {
                    internal.get_or_insert(msg);
                }
            }
        }
        if let Some(msg) = internal {
            error!(target: "validation", "script verification could not run: {msg}");
            return Ok(Err(BlockValidationState::error("script-verify-error").with_debug(msg)));
        }
        Ok(match invalid {
            None => Ok(()),
            Some(msg) => Err(BlockValidationState::invalid(
                BlockValidationResult::Consensus,
                "mandatory-script-verify-flag-failed",
            )
            .with_debug(msg)),
        })
    }

    fn sync_state(&self, st: &mut ChainState) -> SynchronizationState {
        if st.reindexing {
            SynchronizationState::InitReindex
        } else if self.is_ibd(st) {
            SynchronizationState::InitDownload
        } else {
            SynchronizationState::PostInit
        }
    }

    /// Latches to `false` once the tip is recent.
    fn is_ibd(&self, st: &mut ChainState) -> bool {
        if st.ibd_done {
            return false;
        }
        let Some(tip) = st.chain.tip() else {
            return true;
        };
        if st.index.e(tip).header.time < now().saturating_sub(MAX_TIP_AGE) {
            return true;
        }
        info!(target: "validation", "leaving initial block download");
        st.ibd_done = true;
        false
    }

    fn verification_progress(st: &ChainState) -> f64 {
        let tip_height = st.chain.height().max(0) as f64;
        let best = st
            .index
            .best_header()
            .map(|id| st.index.e(id).height)
            .unwrap_or(0)
            .max(st.chain.height())
            .max(1) as f64;
        (tip_height / best).min(1.0)
    }

    fn notify_tip(&self, st: &mut ChainState) {
        let Some(tip) = st.chain.tip() else {
            return;
        };
        let state = self.sync_state(st);
        let progress = Self::verification_progress(st);
        self.update_version_warning(st);
        if let Some(entry) = st.index.get(tip) {
            info!(
                target: "validation",
                hash = %entry.block_hash(),
                height = entry.height(),
                progress,
                "new chain tip"
            );
            self.context.notifications().block_tip(state, entry, progress);
        }
    }

    fn set_warning(&self, st: &mut ChainState, warning: Warning, active: bool, message: &str) {
        let notifications = self.context.notifications();
        if active && st.warnings.insert(warning) {
            warn!(target: "validation", "{message}");
            notifications.warning_set(warning, message);
        } else if !active && st.warnings.remove(&warning) {
            notifications.warning_unset(warning);
        }
    }

    fn update_version_warning(&self, st: &mut ChainState) {
        let mut unknown = 0usize;
        let mut cur = st.chain.tip();
        for _ in 0..UNKNOWN_VERSION_WINDOW {
            let Some(id) = cur else { break };
            let version = st.index.e(id).header.version.to_consensus();
            if version & VERSIONBITS_TOP_MASK == VERSIONBITS_TOP_BITS && version & !VERSIONBITS_TOP_BITS != 0 {
                unknown += 1;
            }
            cur = st.index.prev(id);
        }
        self.set_warning(
            st,
            Warning::UnknownNewRulesActivated,
            unknown > UNKNOWN_VERSION_THRESHOLD,
            "unknown new rules activated (versionbit signalling)",
        );
    }

    fn update_invalid_chain_warning(&self, st: &mut ChainState, failed: EntryId) {
        let Some(tip) = st.chain.tip() else {
            return;
        };
        let tip_entry = st.index.e(tip);
        let mut threshold: Work = tip_entry.chain_work;
        for _ in 0..LARGE_WORK_BLOCKS {
            threshold = threshold + tip_entry.header.work();
        }
        if st.index.e(failed).chain_work > threshold {
            self.set_warning(
                st,
                Warning::LargeWorkInvalidChain,
                true,
                "found invalid chain with significantly more work than the active chain",
            );
        }
    }

    /// Height of the active tip, `-1` when empty.
    pub fn tip_height(&self) -> KernelResult<i32> {
        Ok(self.read()?.chain().height())
    }

    /// Hash of the active tip.
    pub fn tip_hash(&self) -> KernelResult<Option<BlockHash>> {
        Ok(self.read()?.chain().tip().map(|e| e.block_hash()))
    }

    /// Whether the node still considers itself in initial block download.
    pub fn is_initial_block_download(&self) -> KernelResult<bool> {
        let mut st = self.write()?;
        Ok(self.is_ibd(&mut st))
    }

    /// Load the full block of `entry` from the block files.
    pub fn read_block(&self, entry: EntryRef<'_>) -> KernelResult<Block> {
        let hash = entry.block_hash();
        let pos = entry
            .data_pos()
            .ok_or_else(|| StoreError::NotFound(format!("block data for {hash}")))?;
        let block = self.blocks.read_block(pos)?;
        if block.block_hash() != hash {
            return Err(StoreError::CorruptData(format!(
                "block at {pos:?} hashes to {}, expected {hash}",
                block.block_hash()
            ))
            .into());
        }
        Ok(block)
    }

    /// Load the undo data of `entry`. Genesis has none and yields an empty
    /// record.
    pub fn read_undo(&self, entry: EntryRef<'_>) -> KernelResult<BlockUndo> {
        if entry.height() == 0 {
            return Ok(BlockUndo::default());
        }
        let hash = entry.block_hash();
        let pos = entry
            .undo_pos()
            .ok_or_else(|| StoreError::NotFound(format!("undo data for {hash}")))?;
        Ok(self.blocks.read_undo(pos, &hash)?)
    }

    /// Unspent coin at `outpoint` on the active chain.
    pub fn get_coin(&self, outpoint: &OutPoint) -> KernelResult<Option<Coin>> {
        Ok(self.read()?.coins().get(outpoint).cloned())
    }

    pub(crate) fn reindex_pending(&self) -> KernelResult<bool> {
        Ok(self.read()?.guard.reindexing)
    }

    /// Finish a reindex: make sure genesis is stored, connect everything and
    /// drop the persisted flag.
    pub(crate) fn finish_reindex(&self) -> KernelResult<()> {
        let mut st = self.write()?;
        self.ensure_genesis(&mut st, true)?;
        st.reindexing = false;
        self.activate_best_chain(&mut st, None)?;
        self.flush_index(&mut st)?;
        self.block_tree_db.delete(REINDEX_KEY).context("clear reindex flag")?;
        info!(target: "reindex", height = st.chain.height(), "reindex finished");
        Ok(())
    }

    pub(crate) fn notify_progress(&self, title: &str, percent: i32) {
        self.context.notifications().progress(title, percent, false);
    }
}

impl Drop for ChainstateManager {
    fn drop(&mut self) {
        let Ok(mut st) = self.state.write() else {
            return;
        };
        let dirty = st.index.take_dirty();
        if dirty.is_empty() {
            return;
        }
        let batch = self.index_batch(&st, &dirty);
        if let Err(e) = self.block_tree_db.write_batch(batch) {
            warn!(target: "kernel", "final block index flush failed: {e:#}");
        }
    }
}

impl fmt::Debug for ChainstateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainstateManager")
            .field("context", &self.context)
            .field("blocks_dir", &self.blocks.dir())
            .field("worker_threads", &self.pool.as_ref().map(|p| p.current_num_threads()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chainparams::ChainType;
    use crate::context::ContextOptions;

    fn regtest() -> Context {
        ContextOptions::new().with_chain_type(ChainType::Regtest).build()
    }

    #[test]
    fn wiping_block_tree_alone_is_rejected() {
        let ctx = regtest();
        let err = ChainstateManagerOptions::new(&ctx, "/tmp/x", "/tmp/x/blocks")
            .with_wipe_dbs(true, false)
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidOptions(_)));
        assert!(ChainstateManagerOptions::new(&ctx, "/tmp/x", "/tmp/x/blocks")
            .with_wipe_dbs(true, true)
            .is_ok());
    }

    #[test]
    fn worker_threads_are_clamped() {
        let ctx = regtest();
        let opts = ChainstateManagerOptions::new(&ctx, "/tmp/x", "/tmp/x/blocks").with_worker_threads(64);
        assert_eq!(opts.worker_threads, MAX_WORKER_THREADS);
    }

    #[test]
    fn fresh_manager_connects_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = regtest();
        let opts = ChainstateManagerOptions::new(&ctx, dir.path(), dir.path().join("blocks"))
            .with_block_tree_db_in_memory(true)
            .with_chainstate_db_in_memory(true);
        let manager = ChainstateManager::new(opts).unwrap();
        let guard = manager.read().unwrap();
        let tip = guard.chain().tip().unwrap();
        assert_eq!(tip.height(), 0);
        assert_eq!(tip.block_hash(), ctx.chain_params().genesis_hash());
        assert_eq!(tip.status(), BlockStatus::ValidChain);
        assert!(!tip.has_undo());
        assert!(manager.read_undo(tip).unwrap().txs.is_empty());
        assert!(guard.coins().is_empty());
    }
}
