//! The active chain: one entry id per height from genesis to the tip.
use super::{BlockIndex, EntryId, EntryRef};

/// Ids of the active chain, `entries[h]` at height `h`.
#[derive(Debug, Clone, Default)]
pub struct ActiveChain {
    entries: Vec<EntryId>,
}

impl ActiveChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Height of the tip, `-1` when empty.
    pub fn height(&self) -> i32 {
        self.entries.len() as i32 - 1
    }

    /// Entry at `height`.
    pub fn get(&self, height: i32) -> Option<EntryId> {
        usize::try_from(height)
            .ok()
            .and_then(|h| self.entries.get(h))
            .copied()
    }

    /// The tip.
    pub fn tip(&self) -> Option<EntryId> {
        self.entries.last().copied()
    }

    /// Whether `id` (at `height`) is on the chain.
    pub fn contains(&self, id: EntryId, height: i32) -> bool {
        self.get(height) == Some(id)
    }

    /// Ids from genesis to tip.
    pub fn iter(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.entries.iter().copied()
    }

    /// Point the chain at `tip`, rewriting only the heights that changed.
    pub fn set_tip(&mut self, index: &BlockIndex, tip: Option<EntryId>) {
        let Some(tip) = tip else {
            self.entries.clear();
            return;
        };
        let height = index.e(tip).height;
        self.entries.resize(height as usize + 1, tip);
        let mut cur = Some(tip);
        while let Some(id) = cur {
            let h = index.e(id).height as usize;
            if self.entries[h] == id && id != tip {
                break;
            }
            self.entries[h] = id;
            cur = index.e(id).parent;
        }
    }

    /// Highest entry shared by the chain and the ancestry of `id`.
    pub fn find_fork(&self, index: &BlockIndex, id: EntryId) -> Option<EntryId> {
        let mut cur = Some(id);
        if index.e(id).height > self.height() {
            cur = index.ancestor(id, self.height());
        }
        while let Some(c) = cur {
            if self.contains(c, index.e(c).height) {
                return Some(c);
            }
            cur = index.e(c).parent;
        }
        None
    }
}

/// Read-only view of the active chain that resolves ids through the index.
#[derive(Clone, Copy)]
pub struct ChainView<'a> {
    chain: &'a ActiveChain,
    index: &'a BlockIndex,
}

impl<'a> ChainView<'a> {
    pub(crate) fn new(chain: &'a ActiveChain, index: &'a BlockIndex) -> Self {
        Self { chain, index }
    }

    /// Height of the tip, `-1` before genesis is connected.
    pub fn height(&self) -> i32 {
        self.chain.height()
    }

    /// Entry at `height`.
    pub fn get(&self, height: i32) -> Option<EntryRef<'a>> {
        self.chain.get(height).and_then(|id| self.index.get(id))
    }

    /// The tip.
    pub fn tip(&self) -> Option<EntryRef<'a>> {
        self.chain.tip().and_then(|id| self.index.get(id))
    }

    /// Entry at height 0.
    pub fn genesis(&self) -> Option<EntryRef<'a>> {
        self.get(0)
    }

    /// Whether `entry` is on the active chain.
    pub fn contains(&self, entry: EntryRef<'_>) -> bool {
        self.chain.contains(entry.id(), entry.height())
    }

    /// Fork point between the chain and `entry`'s ancestry.
    pub fn find_fork(&self, entry: EntryRef<'_>) -> Option<EntryRef<'a>> {
        self.chain
            .find_fork(self.index, entry.id())
            .and_then(|id| self.index.get(id))
    }

    /// Entries from genesis to tip.
    pub fn iter(&self) -> impl Iterator<Item = EntryRef<'a>> + 'a {
        let index = self.index;
        self.chain.entries.iter().filter_map(move |id| index.get(*id))
    }
}
