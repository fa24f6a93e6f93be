//! In-memory block tree.
//!
//! Entries live in an arena (`Vec`) addressed by [`EntryId`]; the parent is
//! stored as an id, and a hash map resolves block hashes to ids. Entries are
//! only ever appended, so a parent's id is always lower than its children's
//! and the arena order doubles as first-seen order.
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use bitcoin::{block::Header, consensus, hashes::Hash, BlockHash, Work};

use crate::blockstore::FlatFilePos;
use crate::error::IndexError;
use crate::validation::BlockValidationResult;

pub mod chain;

pub use chain::{ActiveChain, ChainView};

/// Number of timestamps in the median-time-past window.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Slot of an entry in the [`BlockIndex`] arena. Also its first-seen rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u32);

impl EntryId {
    /// Insertion sequence number.
    pub fn sequence(self) -> u32 {
        self.0
    }

    /// The first entry inserted, genesis in a populated index.
    pub(crate) const fn first() -> Self {
        EntryId(0)
    }

    fn slot(self) -> usize {
        self.0 as usize
    }
}

/// Why an entry is failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// The block itself broke a rule.
    Invalid(BlockValidationResult),
    /// Some ancestor is failed.
    InvalidAncestor,
}

/// Validation status of an entry.
///
/// Non-failed states are ordered `Unknown < HeaderOnly < ValidTree < ValidChain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockStatus {
    /// Nothing checked yet.
    Unknown,
    /// Header passed header validation.
    HeaderOnly,
    /// Block data stored and passed context-free and contextual checks.
    ValidTree,
    /// Block was connected to the active chain at least once.
    ValidChain,
    /// Permanently invalid.
    Failed(FailureReason),
}

impl BlockStatus {
    fn rank(self) -> Option<u8> {
        match self {
            BlockStatus::Unknown => Some(0),
            BlockStatus::HeaderOnly => Some(1),
            BlockStatus::ValidTree => Some(2),
            BlockStatus::ValidChain => Some(3),
            BlockStatus::Failed(_) => None,
        }
    }

    /// Whether this is a `Failed` status.
    pub fn is_failed(self) -> bool {
        matches!(self, BlockStatus::Failed(_))
    }

    /// Non-failed and at least as advanced as `level`.
    pub fn is_at_least(self, level: BlockStatus) -> bool {
        match (self.rank(), level.rank()) {
            (Some(a), Some(b)) => a >= b,
            _ => false,
        }
    }

    fn to_codes(self) -> (u8, u8) {
        match self {
            BlockStatus::Unknown => (0, 0),
            BlockStatus::HeaderOnly => (1, 0),
            BlockStatus::ValidTree => (2, 0),
            BlockStatus::ValidChain => (3, 0),
            BlockStatus::Failed(FailureReason::Invalid(r)) => (4, r.code()),
            BlockStatus::Failed(FailureReason::InvalidAncestor) => (4, 0xff),
        }
    }

    fn from_codes(status: u8, reason: u8) -> Option<Self> {
        Some(match (status, reason) {
            (0, _) => BlockStatus::Unknown,
            (1, _) => BlockStatus::HeaderOnly,
            (2, _) => BlockStatus::ValidTree,
            (3, _) => BlockStatus::ValidChain,
            (4, 0xff) => BlockStatus::Failed(FailureReason::InvalidAncestor),
            (4, code) => BlockStatus::Failed(FailureReason::Invalid(
                BlockValidationResult::from_code(code)?,
            )),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BlockIndexEntry {
    pub(crate) header: Header,
    pub(crate) hash: BlockHash,
    pub(crate) height: i32,
    pub(crate) chain_work: Work,
    pub(crate) status: BlockStatus,
    pub(crate) parent: Option<EntryId>,
    pub(crate) data_pos: Option<FlatFilePos>,
    pub(crate) undo_pos: Option<FlatFilePos>,
    pub(crate) tx_count: u32,
    /// This entry and every ancestor have block data stored.
    pub(crate) chain_data: bool,
}

/// The tree of every header seen, with validation status and storage
/// locations.
#[derive(Debug, Default)]
pub struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<BlockHash, EntryId>,
    best_header: Option<EntryId>,
    /// Entries eligible to become the chain tip, most work first, then
    /// first seen.
    candidates: BTreeSet<(Reverse<Work>, EntryId)>,
    /// Entries with data whose parent chain is still missing data, by parent.
    unlinked: HashMap<EntryId, Vec<EntryId>>,
    dirty: BTreeSet<EntryId>,
}

impl BlockIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no header (not even genesis) is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add `header` with `Unknown` status.
    ///
    /// Fails with [`IndexError::MissingParent`] unless the parent is indexed;
    /// a header with a null parent is only accepted as the first entry.
    /// Re-inserting a known header returns the existing id unchanged.
    pub fn insert(&mut self, header: Header) -> Result<EntryId, IndexError> {
        let hash = header.block_hash();
        if let Some(id) = self.by_hash.get(&hash) {
            return Ok(*id);
        }

        let parent = if header.prev_blockhash == BlockHash::all_zeros() {
            if !self.entries.is_empty() {
                return Err(IndexError::DuplicateGenesis { hash });
            }
            None
        } else {
            Some(
                self.lookup(&header.prev_blockhash)
                    .ok_or(IndexError::MissingParent {
                        hash,
                        prev: header.prev_blockhash,
                    })?,
            )
        };

        let (height, chain_work) = match parent {
            Some(p) => {
                let parent = self.e(p);
                (parent.height + 1, parent.chain_work + header.work())
            }
            None => (0, header.work()),
        };

        let id = EntryId(self.entries.len() as u32);
        self.entries.push(BlockIndexEntry {
            header,
            hash,
            height,
            chain_work,
            status: BlockStatus::Unknown,
            parent,
            data_pos: None,
            undo_pos: None,
            tx_count: 0,
            chain_data: false,
        });
        self.by_hash.insert(hash, id);
        self.dirty.insert(id);
        Ok(id)
    }

    /// Resolve a block hash.
    pub fn lookup(&self, hash: &BlockHash) -> Option<EntryId> {
        self.by_hash.get(hash).copied()
    }

    /// Borrowed view of `id`, if it belongs to this index.
    pub fn get(&self, id: EntryId) -> Option<EntryRef<'_>> {
        (id.slot() < self.entries.len()).then_some(EntryRef { index: self, id })
    }

    /// Borrowed view of the entry for `hash`.
    pub fn get_by_hash(&self, hash: &BlockHash) -> Option<EntryRef<'_>> {
        self.lookup(hash).and_then(|id| self.get(id))
    }

    /// The parent, or `None` for genesis.
    pub fn prev(&self, id: EntryId) -> Option<EntryId> {
        self.e(id).parent
    }

    /// Status of `id`.
    pub fn status(&self, id: EntryId) -> BlockStatus {
        self.e(id).status
    }

    /// Highest-work entry with at least `HeaderOnly` status; first seen wins ties.
    pub fn best_header(&self) -> Option<EntryId> {
        self.best_header
    }

    /// Move `id` to `status`.
    ///
    /// Valid statuses only advance; `Failed` may be entered from any
    /// non-failed state and then eagerly marks every descendant
    /// `Failed(InvalidAncestor)`. Returns the descendants that were marked.
    pub fn mark_status(
        &mut self,
        id: EntryId,
        status: BlockStatus,
    ) -> Result<Vec<EntryId>, IndexError> {
        let from = self.e(id).status;
        if from == status {
            return Ok(Vec::new());
        }
        let allowed = match (from.rank(), status.rank()) {
            (Some(a), Some(b)) => b > a,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !allowed {
            return Err(IndexError::InvalidStatusTransition { from, to: status });
        }

        self.set_status(id, status);
        if !status.is_failed() {
            self.maybe_add_candidate(id);
            self.update_best_header(id);
            return Ok(Vec::new());
        }

        let descendants = self.propagate_failure(id);
        if let Some(best) = self.best_header {
            if self.e(best).status.is_failed() {
                self.recompute_best_header();
            }
        }
        Ok(descendants)
    }

    fn set_status(&mut self, id: EntryId, status: BlockStatus) {
        self.entries[id.slot()].status = status;
        if status.is_failed() {
            let work = self.entries[id.slot()].chain_work;
            self.candidates.remove(&(Reverse(work), id));
        }
        self.dirty.insert(id);
    }

    /// Parents precede children in the arena, so one forward pass reaches
    /// every descendant.
    fn propagate_failure(&mut self, root: EntryId) -> Vec<EntryId> {
        self.forget_unlinked(root);
        let mut failed = Vec::new();
        for slot in root.slot() + 1..self.entries.len() {
            let Some(parent) = self.entries[slot].parent else {
                continue;
            };
            let parent_failed = parent == root || self.e(parent).status.is_failed();
            if parent_failed && !self.entries[slot].status.is_failed() {
                let id = EntryId(slot as u32);
                self.set_status(id, BlockStatus::Failed(FailureReason::InvalidAncestor));
                self.unlinked.remove(&id);
                failed.push(id);
            }
        }
        failed
    }

    fn update_best_header(&mut self, id: EntryId) {
        let entry = self.e(id);
        if !entry.status.is_at_least(BlockStatus::HeaderOnly) {
            return;
        }
        let better = match self.best_header {
            None => true,
            Some(best) => {
                let b = self.e(best);
                entry.chain_work > b.chain_work || (entry.chain_work == b.chain_work && id < best)
            }
        };
        if better {
            self.best_header = Some(id);
        }
    }

    fn recompute_best_header(&mut self) {
        self.best_header = None;
        for slot in 0..self.entries.len() {
            self.update_best_header(EntryId(slot as u32));
        }
    }

    /// Record where the block's data was written.
    pub(crate) fn set_data_pos(&mut self, id: EntryId, pos: FlatFilePos, tx_count: u32) {
        let entry = &mut self.entries[id.slot()];
        entry.data_pos = Some(pos);
        entry.tx_count = tx_count;
        self.dirty.insert(id);
        self.link_chain_data(id);
    }

    /// Record where the block's undo data was written.
    pub(crate) fn set_undo_pos(&mut self, id: EntryId, pos: FlatFilePos) {
        self.entries[id.slot()].undo_pos = Some(pos);
        self.dirty.insert(id);
    }

    fn link_chain_data(&mut self, id: EntryId) {
        let parent_linked = match self.e(id).parent {
            None => true,
            Some(p) => self.e(p).chain_data,
        };
        if !parent_linked {
            if let Some(p) = self.e(id).parent {
                self.unlinked.entry(p).or_default().push(id);
            }
            return;
        }

        let mut queue = vec![id];
        while let Some(next) = queue.pop() {
            self.entries[next.slot()].chain_data = true;
            self.maybe_add_candidate(next);
            if let Some(children) = self.unlinked.remove(&next) {
                queue.extend(children);
            }
        }
    }

    /// A failed entry will never link: drop its parked children and its own
    /// slot under its parent.
    fn forget_unlinked(&mut self, id: EntryId) {
        self.unlinked.remove(&id);
        if let Some(parent) = self.e(id).parent {
            if let Some(siblings) = self.unlinked.get_mut(&parent) {
                siblings.retain(|child| *child != id);
                if siblings.is_empty() {
                    self.unlinked.remove(&parent);
                }
            }
        }
    }

    fn maybe_add_candidate(&mut self, id: EntryId) {
        let entry = self.e(id);
        if entry.chain_data && entry.status.is_at_least(BlockStatus::ValidTree) {
            let work = entry.chain_work;
            self.candidates.insert((Reverse(work), id));
        }
    }

    /// Make a block that left the active chain eligible again.
    pub(crate) fn restore_candidate(&mut self, id: EntryId) {
        self.maybe_add_candidate(id);
    }

    /// Most-work entry that could become the tip: at least `ValidTree`,
    /// full data back to genesis, not failed. First seen wins ties.
    pub fn most_work_candidate(&self) -> Option<EntryId> {
        self.candidates.first().map(|(_, id)| *id)
    }

    /// Drop candidates with less work than `tip`; they can no longer win.
    pub(crate) fn prune_candidates(&mut self, tip: EntryId) {
        let work = self.e(tip).chain_work;
        // Everything ordered after (work, MAX) has strictly less work.
        let _ = self.candidates.split_off(&(Reverse(work), EntryId(u32::MAX)));
    }

    /// Number of tip candidates currently tracked.
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Ancestor of `id` at `height`, or `None` if `height` is above `id`.
    pub fn ancestor(&self, id: EntryId, height: i32) -> Option<EntryId> {
        if height < 0 || height > self.e(id).height {
            return None;
        }
        let mut cur = id;
        while self.e(cur).height > height {
            cur = self.e(cur).parent?;
        }
        Some(cur)
    }

    /// Lowest common ancestor (fork point) of `a` and `b`.
    pub fn last_common_ancestor(&self, a: EntryId, b: EntryId) -> Option<EntryId> {
        let height = self.e(a).height.min(self.e(b).height);
        let mut a = self.ancestor(a, height)?;
        let mut b = self.ancestor(b, height)?;
        while a != b {
            a = self.e(a).parent?;
            b = self.e(b).parent?;
        }
        Some(a)
    }

    /// Median timestamp of `id` and its ten predecessors.
    pub fn median_time_past(&self, id: EntryId) -> u32 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cur = Some(id);
        while let Some(c) = cur {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            times.push(self.e(c).header.time);
            cur = self.e(c).parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Ids changed since the last call.
    pub(crate) fn take_dirty(&mut self) -> Vec<EntryId> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    /// Put ids back after a failed flush.
    pub(crate) fn restore_dirty(&mut self, ids: &[EntryId]) {
        self.dirty.extend(ids.iter().copied());
    }

    pub(crate) fn e(&self, id: EntryId) -> &BlockIndexEntry {
        &self.entries[id.slot()]
    }

    /// Serialize one entry for the block tree database.
    pub(crate) fn encode_record(&self, id: EntryId) -> Vec<u8> {
        let entry = self.e(id);
        let mut out = consensus::serialize(&entry.header);
        out.extend_from_slice(&entry.height.to_le_bytes());
        let (status, reason) = entry.status.to_codes();
        out.push(status);
        out.push(reason);
        let flags = u8::from(entry.data_pos.is_some()) | (u8::from(entry.undo_pos.is_some()) << 1);
        out.push(flags);
        for pos in [entry.data_pos, entry.undo_pos] {
            let pos = pos.unwrap_or_default();
            out.extend_from_slice(&pos.file.to_le_bytes());
            out.extend_from_slice(&pos.pos.to_le_bytes());
        }
        out.extend_from_slice(&entry.tx_count.to_le_bytes());
        out
    }

    /// Rebuild an index from `(sequence, record)` pairs.
    pub(crate) fn from_records(
        mut records: Vec<(u32, Vec<u8>)>,
    ) -> Result<Self, IndexError> {
        records.sort_by_key(|(seq, _)| *seq);
        let mut index = Self::new();
        for (seq, bytes) in records {
            let record = Record::decode(&bytes)?;
            if seq as usize != index.entries.len() {
                return Err(IndexError::CorruptRecord(format!(
                    "sequence gap at {seq}, expected {}",
                    index.entries.len()
                )));
            }
            let id = index.insert(record.header).map_err(|e| {
                IndexError::CorruptRecord(format!("record {seq}: {e}"))
            })?;
            if index.e(id).height != record.height {
                return Err(IndexError::CorruptRecord(format!(
                    "record {seq}: height {} does not match tree height {}",
                    record.height,
                    index.e(id).height
                )));
            }
            index.entries[id.slot()].status = record.status;
            index.entries[id.slot()].tx_count = record.tx_count;
            index.entries[id.slot()].undo_pos = record.undo_pos;
            if let Some(pos) = record.data_pos {
                index.set_data_pos(id, pos, record.tx_count);
            }
            index.maybe_add_candidate(id);
            index.update_best_header(id);
        }
        index.dirty.clear();
        Ok(index)
    }
}

const RECORD_LEN: usize = 80 + 4 + 3 + 16 + 4;

struct Record {
    header: Header,
    height: i32,
    status: BlockStatus,
    data_pos: Option<FlatFilePos>,
    undo_pos: Option<FlatFilePos>,
    tx_count: u32,
}

impl Record {
    fn decode(bytes: &[u8]) -> Result<Self, IndexError> {
        if bytes.len() != RECORD_LEN {
            return Err(IndexError::CorruptRecord(format!(
                "record length {} != {RECORD_LEN}",
                bytes.len()
            )));
        }
        let header: Header = consensus::deserialize(&bytes[..80])
            .map_err(|e| IndexError::CorruptRecord(format!("header: {e}")))?;
        let u32_at = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(buf)
        };
        let height = u32_at(80) as i32;
        let status = BlockStatus::from_codes(bytes[84], bytes[85]).ok_or_else(|| {
            IndexError::CorruptRecord(format!("status code {}/{}", bytes[84], bytes[85]))
        })?;
        let flags = bytes[86];
        let data_pos = (flags & 1 != 0).then(|| FlatFilePos::new(u32_at(87), u32_at(91)));
        let undo_pos = (flags & 2 != 0).then(|| FlatFilePos::new(u32_at(95), u32_at(99)));
        Ok(Self {
            header,
            height,
            status,
            data_pos,
            undo_pos,
            tx_count: u32_at(103),
        })
    }
}

/// A borrowed view of one entry, valid while the owning [`BlockIndex`] is
/// borrowed.
#[derive(Clone, Copy)]
pub struct EntryRef<'a> {
    index: &'a BlockIndex,
    id: EntryId,
}

impl<'a> EntryRef<'a> {
    fn e(&self) -> &'a BlockIndexEntry {
        self.index.e(self.id)
    }

    /// Arena id.
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Block hash.
    pub fn block_hash(&self) -> BlockHash {
        self.e().hash
    }

    /// Distance from genesis.
    pub fn height(&self) -> i32 {
        self.e().height
    }

    /// The header.
    pub fn header(&self) -> Header {
        self.e().header
    }

    /// Cumulative work from genesis to here.
    pub fn chain_work(&self) -> Work {
        self.e().chain_work
    }

    /// Validation status.
    pub fn status(&self) -> BlockStatus {
        self.e().status
    }

    /// The parent entry, `None` for genesis.
    pub fn prev(&self) -> Option<EntryRef<'a>> {
        self.e().parent.map(|id| EntryRef {
            index: self.index,
            id,
        })
    }

    /// Whether the full block is stored.
    pub fn has_data(&self) -> bool {
        self.e().data_pos.is_some()
    }

    /// Whether undo data is stored.
    pub fn has_undo(&self) -> bool {
        self.e().undo_pos.is_some()
    }

    /// Location of the block data.
    pub fn data_pos(&self) -> Option<FlatFilePos> {
        self.e().data_pos
    }

    /// Location of the undo data.
    pub fn undo_pos(&self) -> Option<FlatFilePos> {
        self.e().undo_pos
    }

    /// Number of transactions, 0 until block data is stored.
    pub fn tx_count(&self) -> u32 {
        self.e().tx_count
    }
}

impl PartialEq for EntryRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.index, other.index) && self.id == other.id
    }
}

impl Eq for EntryRef<'_> {}

impl fmt::Debug for EntryRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("height", &self.height())
            .field("hash", &self.block_hash())
            .field("status", &self.status())
            .finish()
    }
}
