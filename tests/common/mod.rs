//! Shared helpers: regtest block mining and an event recorder.
#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use bitcoin::hashes::Hash as _;
use bitcoin::{
    absolute::LockTime,
    block::{Header, Version},
    opcodes::OP_TRUE,
    script::Builder,
    transaction, Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Target,
    Transaction, TxIn, TxMerkleNode, TxOut, Witness,
};
use blocktree_kernel::prelude::*;
use blocktree_kernel::{SynchronizationState, Warning};

pub const REGTEST_BITS: u32 = 0x207fffff;

/// Anyone-can-spend output script.
pub fn op_true() -> ScriptBuf {
    Builder::new().push_opcode(OP_TRUE).into_script()
}

/// Coinbase for `height`; `salt` keeps blocks on different forks distinct.
pub fn coinbase(height: i32, salt: u32, value: Amount) -> Transaction {
    Transaction {
        version: transaction::Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Builder::new()
                .push_int(i64::from(height))
                .push_int(i64::from(salt) + 1)
                .into_script(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value,
            script_pubkey: op_true(),
        }],
    }
}

/// One-input, one-output transaction spending `prev`.
pub fn spend(prev: OutPoint, value: Amount) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: prev,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value,
            script_pubkey: op_true(),
        }],
    }
}

/// Grind the nonce until the header meets its own target.
pub fn grind(mut header: Header) -> Header {
    let target = Target::from_compact(header.bits);
    while Target::from_le_bytes(header.block_hash().to_byte_array()) > target {
        header.nonce += 1;
    }
    header
}

/// Grind the nonce until the header misses its own target.
pub fn grind_invalid(mut header: Header) -> Header {
    let target = Target::from_compact(header.bits);
    while Target::from_le_bytes(header.block_hash().to_byte_array()) <= target {
        header.nonce += 1;
    }
    header
}

/// Header template on top of `parent`, ten minutes later.
pub fn child_header(parent: &Header) -> Header {
    Header {
        version: Version::from_consensus(4),
        prev_blockhash: parent.block_hash(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: parent.time + 600,
        bits: CompactTarget::from_consensus(REGTEST_BITS),
        nonce: 0,
    }
}

/// Mine a block on `parent` at `height` with a fresh coinbase followed by
/// `txs`.
pub fn mine(parent: &Header, height: i32, salt: u32, txs: Vec<Transaction>) -> Block {
    let mut txdata = vec![coinbase(height, salt, Amount::from_int_btc(50))];
    txdata.extend(txs);
    let mut block = Block {
        header: child_header(parent),
        txdata,
    };
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }
    block.header = grind(block.header);
    block
}

/// `count` empty blocks on top of `parent` (at `parent_height`).
pub fn mine_chain(parent: &Header, parent_height: i32, count: usize, salt: u32) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::with_capacity(count);
    let mut prev = *parent;
    for i in 0..count {
        let block = mine(&prev, parent_height + 1 + i as i32, salt, Vec::new());
        prev = block.header;
        blocks.push(block);
    }
    blocks
}

/// Outpoint of the coinbase output of `block`.
pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.txdata[0].compute_txid(), 0)
}

/// Everything the observers saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Checked(BlockHash, bool),
    PowValid(BlockHash),
    Connected(BlockHash, i32),
    Disconnected(BlockHash, i32),
    Tip(SynchronizationState, i32, BlockHash),
    HeaderTip(i32),
    Progress(String, i32),
    WarningSet(Warning),
    WarningUnset(Warning),
    FlushError,
    Fatal,
}

#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl KernelNotifications for Recorder {
    fn block_tip(&self, state: SynchronizationState, entry: EntryRef<'_>, _progress: f64) {
        self.push(Event::Tip(state, entry.height(), entry.block_hash()));
    }

    fn header_tip(&self, _state: SynchronizationState, height: i32, _timestamp: u32, _presync: bool) {
        self.push(Event::HeaderTip(height));
    }

    fn progress(&self, title: &str, percent: i32, _resume_possible: bool) {
        self.push(Event::Progress(title.to_string(), percent));
    }

    fn warning_set(&self, warning: Warning, _message: &str) {
        self.push(Event::WarningSet(warning));
    }

    fn warning_unset(&self, warning: Warning) {
        self.push(Event::WarningUnset(warning));
    }

    fn flush_error(&self, _message: &str) {
        self.push(Event::FlushError);
    }

    fn fatal_error(&self, _message: &str) {
        self.push(Event::Fatal);
    }
}

impl ValidationInterface for Recorder {
    fn block_checked(&self, block: &Block, state: &BlockValidationState) {
        self.push(Event::Checked(block.block_hash(), state.is_valid()));
    }

    fn pow_valid_block(&self, block: &Block, _entry: EntryRef<'_>) {
        self.push(Event::PowValid(block.block_hash()));
    }

    fn block_connected(&self, block: &Block, entry: EntryRef<'_>) {
        self.push(Event::Connected(block.block_hash(), entry.height()));
    }

    fn block_disconnected(&self, block: &Block, entry: EntryRef<'_>) {
        self.push(Event::Disconnected(block.block_hash(), entry.height()));
    }
}

/// Regtest context reporting into a fresh recorder.
pub fn regtest() -> (Context, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let ctx = ContextOptions::new()
        .with_chain_type(ChainType::Regtest)
        .with_notifications(recorder.clone())
        .with_validation_interface(recorder.clone())
        .build();
    (ctx, recorder)
}

/// Manager with in-memory databases and block files under `dir`.
pub fn in_memory(ctx: &Context, dir: &Path) -> ChainstateManager {
    let options = ChainstateManagerOptions::new(ctx, dir, dir.join("blocks"))
        .with_block_tree_db_in_memory(true)
        .with_chainstate_db_in_memory(true);
    ChainstateManager::new(options).unwrap()
}

/// Manager with SQLite databases under `dir`.
pub fn on_disk(ctx: &Context, dir: &Path) -> ChainstateManager {
    ChainstateManager::new(ChainstateManagerOptions::new(ctx, dir, dir.join("blocks"))).unwrap()
}

/// Feed `blocks` in order, asserting each is new and valid.
pub fn process_all(manager: &ChainstateManager, blocks: &[Block]) {
    for block in blocks {
        let outcome = manager.process_block(block).unwrap();
        assert!(outcome.new_block, "block {} was not new", block.block_hash());
        assert!(outcome.state.is_valid(), "block {}: {}", block.block_hash(), outcome.state);
    }
}

/// Regtest genesis header.
pub fn genesis_header(ctx: &Context) -> Header {
    ctx.chain_params().genesis_block().header
}
