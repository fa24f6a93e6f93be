//! Unspent outputs, the per-block overlay used while connecting, and undo
//! records.
use std::collections::HashMap;

use bitcoin::{consensus, hashes::Hash, OutPoint, TxOut, Txid};

use crate::error::StoreError;

/// Key prefix of coin rows in the chainstate database.
pub const COIN_PREFIX: u8 = b'C';

/// An unspent output and where it was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    /// Amount and locking script.
    pub output: TxOut,
    /// Height of the block that created it.
    pub height: i32,
    /// Created by a coinbase transaction.
    pub is_coinbase: bool,
}

impl Coin {
    /// `[height: i32 LE][coinbase: u8][TxOut]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48);
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.height.to_le_bytes());
        out.push(u8::from(self.is_coinbase));
        out.extend_from_slice(&consensus::serialize(&self.output));
    }

    /// Inverse of [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (coin, used) = Self::decode_partial(bytes)?;
        if used != bytes.len() {
            return Err(StoreError::CorruptData(format!(
                "{} trailing bytes after coin",
                bytes.len() - used
            )));
        }
        Ok(coin)
    }

    fn decode_partial(bytes: &[u8]) -> Result<(Self, usize), StoreError> {
        if bytes.len() < 5 {
            return Err(StoreError::CorruptData("coin record too short".into()));
        }
        let height = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let is_coinbase = match bytes[4] {
            0 => false,
            1 => true,
            b => return Err(StoreError::CorruptData(format!("coinbase flag {b}"))),
        };
        let (output, used): (TxOut, usize) = consensus::deserialize_partial(&bytes[5..])
            .map_err(|e| StoreError::CorruptData(format!("coin output: {e}")))?;
        Ok((
            Self {
                output,
                height,
                is_coinbase,
            },
            5 + used,
        ))
    }
}

/// Database key for `outpoint`: prefix, txid, big-endian vout.
pub fn coin_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(37);
    key.push(COIN_PREFIX);
    key.extend_from_slice(outpoint.txid.as_byte_array());
    key.extend_from_slice(&outpoint.vout.to_be_bytes());
    key
}

/// Inverse of [`coin_key`].
pub fn outpoint_from_key(key: &[u8]) -> Option<OutPoint> {
    if key.len() != 37 || key[0] != COIN_PREFIX {
        return None;
    }
    let mut txid = [0u8; 32];
    txid.copy_from_slice(&key[1..33]);
    let vout = u32::from_be_bytes([key[33], key[34], key[35], key[36]]);
    Some(OutPoint {
        txid: Txid::from_byte_array(txid),
        vout,
    })
}

/// Coins spent by one transaction, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxUndo {
    /// The spent coins.
    pub spent: Vec<Coin>,
}

/// Undo data for one block: one [`TxUndo`] per non-coinbase transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockUndo {
    /// Per-transaction undo, coinbase excluded.
    pub txs: Vec<TxUndo>,
}

impl BlockUndo {
    /// `[tx count: u32 LE]` then for each tx `[coin count: u32 LE][coins..]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.txs.len() as u32).to_le_bytes());
        for tx in &self.txs {
            out.extend_from_slice(&(tx.spent.len() as u32).to_le_bytes());
            for coin in &tx.spent {
                coin.encode_into(&mut out);
            }
        }
        out
    }

    /// Inverse of [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut at = 0usize;
        let read_u32 = |at: &mut usize| -> Result<u32, StoreError> {
            let raw = bytes
                .get(*at..*at + 4)
                .ok_or_else(|| StoreError::CorruptData("undo record truncated".into()))?;
            *at += 4;
            Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        };

        let tx_count = read_u32(&mut at)?;
        let mut txs = Vec::new();
        for _ in 0..tx_count {
            let coin_count = read_u32(&mut at)?;
            let mut spent = Vec::new();
            for _ in 0..coin_count {
                let (coin, used) = Coin::decode_partial(&bytes[at..])?;
                at += used;
                spent.push(coin);
            }
            txs.push(TxUndo { spent });
        }
        if at != bytes.len() {
            return Err(StoreError::CorruptData(format!(
                "{} trailing bytes after undo",
                bytes.len() - at
            )));
        }
        Ok(Self { txs })
    }
}

/// The full unspent output set, mirrored from the chainstate database.
#[derive(Debug, Default)]
pub struct UtxoSet {
    coins: HashMap<OutPoint, Coin>,
}

impl UtxoSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Coin at `outpoint`, if unspent.
    pub fn get(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.coins.get(outpoint)
    }

    /// Number of unspent outputs.
    pub fn len(&self) -> usize {
        self.coins.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    pub(crate) fn insert(&mut self, outpoint: OutPoint, coin: Coin) {
        self.coins.insert(outpoint, coin);
    }

    /// Fold committed overlay changes into the set.
    pub(crate) fn apply(&mut self, changes: &HashMap<OutPoint, Option<Coin>>) {
        for (outpoint, change) in changes {
            match change {
                Some(coin) => {
                    self.coins.insert(*outpoint, coin.clone());
                }
                None => {
                    self.coins.remove(outpoint);
                }
            }
        }
    }
}

/// Pending changes on top of a [`UtxoSet`]. Dropping it discards them.
#[derive(Debug)]
pub struct CoinsViewCache<'a> {
    base: &'a UtxoSet,
    changes: HashMap<OutPoint, Option<Coin>>,
}

impl<'a> CoinsViewCache<'a> {
    /// Overlay on `base`.
    pub fn new(base: &'a UtxoSet) -> Self {
        Self {
            base,
            changes: HashMap::new(),
        }
    }

    /// Coin at `outpoint` as seen through the overlay.
    pub fn get(&self, outpoint: &OutPoint) -> Option<&Coin> {
        match self.changes.get(outpoint) {
            Some(change) => change.as_ref(),
            None => self.base.get(outpoint),
        }
    }

    /// Add a new coin.
    pub fn add(&mut self, outpoint: OutPoint, coin: Coin) {
        self.changes.insert(outpoint, Some(coin));
    }

    /// Spend `outpoint`, returning the coin it held.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        let coin = self.get(outpoint)?.clone();
        self.changes.insert(*outpoint, None);
        Some(coin)
    }

    /// The accumulated changes, `None` meaning spent.
    pub fn into_changes(self) -> HashMap<OutPoint, Option<Coin>> {
        self.changes
    }
}
