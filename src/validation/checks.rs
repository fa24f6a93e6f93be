//! Consensus checks. Each returns the rejecting [`BlockValidationState`] as
//! its error so the engine can forward it unchanged.
use std::collections::HashSet;

use bitcoin::{
    block::Header,
    hashes::{sha256d, Hash},
    pow::CompactTarget,
    script::Builder,
    Amount, Block, Sequence, Target, Transaction, TxOut,
};

use crate::chainparams::{ChainParams, COINBASE_MATURITY, MAX_FUTURE_BLOCK_TIME, RETARGET_INTERVAL, TARGET_SPACING};
use crate::coins::{BlockUndo, Coin, CoinsViewCache, TxUndo};
use crate::index::{BlockIndex, EntryId};
use crate::validation::{BlockValidationResult, BlockValidationState};

/// Consensus limit on block weight.
pub const MAX_BLOCK_WEIGHT: u64 = 4_000_000;

const LOCKTIME_THRESHOLD: u32 = 500_000_000;

fn invalid(result: BlockValidationResult, reason: &str) -> BlockValidationState {
    BlockValidationState::invalid(result, reason)
}

fn consensus(reason: &str) -> BlockValidationState {
    invalid(BlockValidationResult::Consensus, reason)
}

/// Header checks against its (known, non-failed) parent.
pub(crate) fn check_header(
    params: &ChainParams,
    index: &BlockIndex,
    parent: EntryId,
    header: &Header,
    now: u32,
) -> Result<(), BlockValidationState> {
    check_proof_of_work(params, header)?;

    if let Some(required) = required_bits(params, index, parent, header) {
        if header.bits != required {
            return Err(invalid(BlockValidationResult::InvalidHeader, "bad-diffbits").with_debug(
                format!(
                    "bits {:#010x}, expected {:#010x}",
                    header.bits.to_consensus(),
                    required.to_consensus()
                ),
            ));
        }
    }

    if header.time <= index.median_time_past(parent) {
        return Err(invalid(BlockValidationResult::InvalidHeader, "time-too-old"));
    }
    if header.time > now.saturating_add(MAX_FUTURE_BLOCK_TIME) {
        return Err(invalid(BlockValidationResult::TimeFuture, "time-too-new")
            .with_debug(format!("block time {} vs now {now}", header.time)));
    }

    let height = index.e(parent).height + 1;
    if header.version.to_consensus() < params.min_version_at(height) {
        return Err(invalid(
            BlockValidationResult::InvalidHeader,
            &format!("bad-version({:#010x})", header.version.to_consensus()),
        ));
    }
    Ok(())
}

/// Target within the network limit and met by the header hash.
pub(crate) fn check_proof_of_work(
    params: &ChainParams,
    header: &Header,
) -> Result<(), BlockValidationState> {
    let target = Target::from_compact(header.bits);
    if target == Target::ZERO || target > params.pow_limit() {
        return Err(invalid(BlockValidationResult::InvalidHeader, "high-hash")
            .with_debug("target outside network limits"));
    }
    let hash_value = Target::from_le_bytes(header.block_hash().to_byte_array());
    if hash_value > target {
        return Err(invalid(BlockValidationResult::InvalidHeader, "high-hash"));
    }
    Ok(())
}

/// Bits a child of `parent` must carry. `None` only if the period's first
/// block is missing from the tree.
fn required_bits(
    params: &ChainParams,
    index: &BlockIndex,
    parent: EntryId,
    header: &Header,
) -> Option<CompactTarget> {
    let prev = index.e(parent);
    let height = prev.height + 1;

    if !params.is_retarget_height(height) {
        if params.allow_min_difficulty_blocks() {
            if header.time > prev.header.time.saturating_add(TARGET_SPACING * 2) {
                return Some(params.pow_limit_bits());
            }
            // Last block that was not mined under the min-difficulty rule.
            let mut cur = parent;
            while let Some(up) = index.prev(cur) {
                let e = index.e(cur);
                if params.is_retarget_height(e.height) || e.header.bits != params.pow_limit_bits() {
                    break;
                }
                cur = up;
            }
            return Some(index.e(cur).header.bits);
        }
        return Some(prev.header.bits);
    }

    if params.no_retargeting() {
        return Some(prev.header.bits);
    }
    let first = index.e(index.ancestor(parent, height - RETARGET_INTERVAL)?);
    let bits = if params.retarget_from_period_start() {
        first.header.bits
    } else {
        prev.header.bits
    };
    Some(params.retarget_bits(bits, first.header.time, prev.header.time))
}

/// Context-free block checks.
///
/// Merkle mismatches and duplicated transactions are reported as
/// [`BlockValidationResult::Mutated`]: the header may still be valid with
/// different block data.
pub(crate) fn check_block(block: &Block) -> Result<(), BlockValidationState> {
    let Some(coinbase) = block.txdata.first() else {
        return Err(consensus("bad-cb-missing"));
    };
    if !coinbase.is_coinbase() {
        return Err(consensus("bad-cb-missing"));
    }
    if block.txdata.iter().skip(1).any(Transaction::is_coinbase) {
        return Err(consensus("bad-cb-multiple"));
    }

    let (root, mutated) = merkle_root(block);
    if root != block.header.merkle_root.to_byte_array() {
        return Err(invalid(BlockValidationResult::Mutated, "bad-txnmrklroot"));
    }
    if mutated {
        return Err(invalid(BlockValidationResult::Mutated, "bad-txns-duplicate"));
    }

    if block.weight().to_wu() > MAX_BLOCK_WEIGHT {
        return Err(consensus("bad-blk-weight"));
    }

    for tx in &block.txdata {
        check_transaction(tx)?;
    }
    Ok(())
}

/// Merkle root over txids, and whether two identical hashes were paired
/// at any level (a block that hashes like a different, valid one).
fn merkle_root(block: &Block) -> ([u8; 32], bool) {
    let mut level: Vec<[u8; 32]> = block
        .txdata
        .iter()
        .map(|tx| tx.compute_txid().to_byte_array())
        .collect();
    let mut mutated = false;
    while level.len() > 1 {
        for pair in level.chunks_exact(2) {
            if pair[0] == pair[1] {
                mutated = true;
            }
        }
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level
            .chunks_exact(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                sha256d::Hash::hash(&buf).to_byte_array()
            })
            .collect();
    }
    (level.first().copied().unwrap_or([0u8; 32]), mutated)
}

fn check_transaction(tx: &Transaction) -> Result<(), BlockValidationState> {
    if tx.input.is_empty() {
        return Err(consensus("bad-txns-vin-empty"));
    }
    if tx.output.is_empty() {
        return Err(consensus("bad-txns-vout-empty"));
    }

    let mut total = Amount::ZERO;
    for out in &tx.output {
        if out.value > Amount::MAX_MONEY {
            return Err(consensus("bad-txns-vout-toolarge"));
        }
        total = total
            .checked_add(out.value)
            .filter(|t| *t <= Amount::MAX_MONEY)
            .ok_or_else(|| consensus("bad-txns-txouttotal-toolarge"))?;
    }

    let mut seen = HashSet::with_capacity(tx.input.len());
    for input in &tx.input {
        if !seen.insert(input.previous_output) {
            return Err(consensus("bad-txns-inputs-duplicate"));
        }
    }

    if tx.is_coinbase() {
        let len = tx.input[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(consensus("bad-cb-length"));
        }
    } else if tx.input.iter().any(|i| i.previous_output.is_null()) {
        return Err(consensus("bad-txns-prevout-null"));
    }
    Ok(())
}

/// Checks that need the block's height and its parent's median time past.
pub(crate) fn check_block_contextual(
    params: &ChainParams,
    block: &Block,
    height: i32,
    parent_mtp: u32,
) -> Result<(), BlockValidationState> {
    let d = params.deployments();
    let cutoff = if height >= d.csv_height {
        parent_mtp
    } else {
        block.header.time
    };
    if block.txdata.iter().any(|tx| !is_final(tx, height, cutoff)) {
        return Err(consensus("bad-txns-nonfinal"));
    }

    if height >= d.bip34_height {
        let expected = Builder::new().push_int(i64::from(height)).into_script();
        let script_sig = block.txdata[0].input[0].script_sig.as_bytes();
        if !script_sig.starts_with(expected.as_bytes()) {
            return Err(consensus("bad-cb-height"));
        }
    }

    let has_witness = block
        .txdata
        .iter()
        .any(|tx| tx.input.iter().any(|i| !i.witness.is_empty()));
    if height >= d.segwit_height {
        if !block.check_witness_commitment() {
            return Err(invalid(BlockValidationResult::Mutated, "bad-witness-merkle-match"));
        }
    } else if has_witness {
        return Err(invalid(BlockValidationResult::Mutated, "unexpected-witness"));
    }
    Ok(())
}

/// Absolute lock-time finality at `height` / `time`.
pub(crate) fn is_final(tx: &Transaction, height: i32, time: u32) -> bool {
    let lock_time = tx.lock_time.to_consensus_u32();
    if lock_time == 0 {
        return true;
    }
    let limit = if lock_time < LOCKTIME_THRESHOLD {
        height.max(0) as u32
    } else {
        time
    };
    if lock_time < limit {
        return true;
    }
    tx.input.iter().all(|i| i.sequence == Sequence::MAX)
}

/// Spend the block's inputs and add its outputs in `view`, enforcing the
/// UTXO rules. Returns the undo data on success.
pub(crate) fn connect_coins(
    params: &ChainParams,
    block: &Block,
    height: i32,
    view: &mut CoinsViewCache<'_>,
) -> Result<BlockUndo, BlockValidationState> {
    let mut undo = BlockUndo::default();
    let mut fees = Amount::ZERO;

    for tx in &block.txdata {
        let txid = tx.compute_txid();
        let is_coinbase = tx.is_coinbase();
        if !is_coinbase {
            let mut spent = Vec::with_capacity(tx.input.len());
            let mut value_in = Amount::ZERO;
            for input in &tx.input {
                let coin = view
                    .spend(&input.previous_output)
                    .ok_or_else(|| consensus("bad-txns-inputs-missingorspent"))?;
                if coin.is_coinbase && height - coin.height < COINBASE_MATURITY {
                    return Err(consensus("bad-txns-premature-spend-of-coinbase"));
                }
                value_in = value_in
                    .checked_add(coin.output.value)
                    .filter(|v| *v <= Amount::MAX_MONEY)
                    .ok_or_else(|| consensus("bad-txns-inputvalues-outofrange"))?;
                spent.push(coin);
            }
            let value_out = output_total(tx);
            let fee = value_in
                .checked_sub(value_out)
                .ok_or_else(|| consensus("bad-txns-in-belowout"))?;
            fees = fees
                .checked_add(fee)
                .filter(|f| *f <= Amount::MAX_MONEY)
                .ok_or_else(|| consensus("bad-txns-fee-outofrange"))?;
            undo.txs.push(TxUndo { spent });
        }

        for (vout, output) in tx.output.iter().enumerate() {
            if output.script_pubkey.is_op_return() {
                continue;
            }
            view.add(
                bitcoin::OutPoint {
                    txid,
                    vout: vout as u32,
                },
                Coin {
                    output: output.clone(),
                    height,
                    is_coinbase,
                },
            );
        }
    }

    let max_reward = params.block_subsidy(height) + fees;
    if output_total(&block.txdata[0]) > max_reward {
        return Err(consensus("bad-cb-amount").with_debug(format!("limit {max_reward}")));
    }
    Ok(undo)
}

fn output_total(tx: &Transaction) -> Amount {
    tx.output
        .iter()
        .fold(Amount::ZERO, |acc, o| acc.checked_add(o.value).unwrap_or(Amount::MAX))
}

/// Reverse [`connect_coins`]: remove the block's outputs and restore the
/// coins recorded in `undo`.
pub(crate) fn disconnect_coins(
    block: &Block,
    undo: &BlockUndo,
    view: &mut CoinsViewCache<'_>,
) -> Result<(), String> {
    if undo.txs.len() + 1 != block.txdata.len() {
        return Err(format!(
            "undo has {} entries for {} transactions",
            undo.txs.len(),
            block.txdata.len()
        ));
    }
    for (i, tx) in block.txdata.iter().enumerate().rev() {
        let txid = tx.compute_txid();
        for vout in 0..tx.output.len() {
            view.spend(&bitcoin::OutPoint {
                txid,
                vout: vout as u32,
            });
        }
        if i == 0 {
            continue;
        }
        let tx_undo = &undo.txs[i - 1];
        if tx_undo.spent.len() != tx.input.len() {
            return Err(format!("undo input count mismatch in tx {txid}"));
        }
        for (input, coin) in tx.input.iter().zip(&tx_undo.spent) {
            view.add(input.previous_output, coin.clone());
        }
    }
    Ok(())
}

/// Spent outputs per non-coinbase transaction, in input order.
pub(crate) fn spent_outputs(undo: &BlockUndo) -> Vec<Vec<TxOut>> {
    undo.txs
        .iter()
        .map(|tx| tx.spent.iter().map(|c| c.output.clone()).collect())
        .collect()
}
