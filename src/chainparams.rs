//! Per-network consensus constants.
//!
//! Exact consensus arithmetic lives here so the engine only asks questions
//! ("what bits are required?", "which script flags apply at this height?")
//! instead of hard-coding network rules.
use bitcoin::{
    absolute::LockTime,
    block::{Header, Version},
    blockdata::constants::genesis_block,
    hashes::Hash,
    pow::CompactTarget,
    transaction, Amount, Block, BlockHash, Network, OutPoint, ScriptBuf, Sequence, Target,
    Transaction, TxIn, TxMerkleNode, TxOut, Witness,
};

use crate::validation::script::ScriptVerificationFlags;

/// Largest allowed distance of a block timestamp into the future (seconds).
pub const MAX_FUTURE_BLOCK_TIME: u32 = 2 * 60 * 60;

/// Number of confirmations before a coinbase output may be spent.
pub const COINBASE_MATURITY: i32 = 100;

/// Blocks per difficulty adjustment period.
pub const RETARGET_INTERVAL: i32 = 2016;

/// Expected seconds between blocks.
pub const TARGET_SPACING: u32 = 600;

const TESTNET4_TIMESTAMP: &str =
    "03/May/2024 000000000000000000001ebd58c244970b3aa9d783bb001011fbe8ea8e98e00e";

/// Supported networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainType {
    /// Bitcoin main network.
    Mainnet,
    /// Testnet3.
    Testnet,
    /// Testnet4.
    Testnet4,
    /// Default signet.
    Signet,
    /// Local regression-test network.
    Regtest,
}

/// Height at which each buried deployment starts being enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deployments {
    /// BIP34: block height in coinbase, version >= 2.
    pub bip34_height: i32,
    /// BIP66: strict DER signatures, version >= 3.
    pub bip66_height: i32,
    /// BIP65: CHECKLOCKTIMEVERIFY, version >= 4.
    pub bip65_height: i32,
    /// BIP68/112/113: relative lock-times.
    pub csv_height: i32,
    /// BIP141/143/147: segregated witness.
    pub segwit_height: i32,
    /// BIP341/342: taproot.
    pub taproot_height: i32,
}

/// Consensus parameters for one network.
#[derive(Debug, Clone)]
pub struct ChainParams {
    chain_type: ChainType,
    genesis: Block,
    magic: [u8; 4],
    pow_limit_bits: CompactTarget,
    no_retargeting: bool,
    allow_min_difficulty_blocks: bool,
    subsidy_halving_interval: i32,
    deployments: Deployments,
}

impl ChainParams {
    /// Parameters for `chain_type`.
    pub fn new(chain_type: ChainType) -> Self {
        match chain_type {
            ChainType::Mainnet => Self {
                chain_type,
                genesis: genesis_block(Network::Bitcoin),
                magic: [0xf9, 0xbe, 0xb4, 0xd9],
                pow_limit_bits: CompactTarget::from_consensus(0x1d00ffff),
                no_retargeting: false,
                allow_min_difficulty_blocks: false,
                subsidy_halving_interval: 210_000,
                deployments: Deployments {
                    bip34_height: 227_931,
                    bip66_height: 363_725,
                    bip65_height: 388_381,
                    csv_height: 419_328,
                    segwit_height: 481_824,
                    taproot_height: 709_632,
                },
            },
            ChainType::Testnet => Self {
                chain_type,
                genesis: genesis_block(Network::Testnet),
                magic: [0x0b, 0x11, 0x09, 0x07],
                pow_limit_bits: CompactTarget::from_consensus(0x1d00ffff),
                no_retargeting: false,
                allow_min_difficulty_blocks: true,
                subsidy_halving_interval: 210_000,
                deployments: Deployments {
                    bip34_height: 21_111,
                    bip66_height: 330_776,
                    bip65_height: 581_885,
                    csv_height: 770_112,
                    segwit_height: 834_624,
                    // Taproot was activated without a buried height here;
                    // enforce it together with segwit.
                    taproot_height: 834_624,
                },
            },
            ChainType::Testnet4 => Self {
                chain_type,
                genesis: testnet4_genesis(),
                magic: [0x1c, 0x16, 0x3f, 0x28],
                pow_limit_bits: CompactTarget::from_consensus(0x1d00ffff),
                no_retargeting: false,
                allow_min_difficulty_blocks: true,
                subsidy_halving_interval: 210_000,
                deployments: Deployments::always(),
            },
            ChainType::Signet => Self {
                chain_type,
                genesis: genesis_block(Network::Signet),
                magic: [0x0a, 0x03, 0xcf, 0x40],
                pow_limit_bits: CompactTarget::from_consensus(0x1e0377ae),
                no_retargeting: false,
                allow_min_difficulty_blocks: false,
                subsidy_halving_interval: 210_000,
                deployments: Deployments::always(),
            },
            ChainType::Regtest => Self {
                chain_type,
                genesis: genesis_block(Network::Regtest),
                magic: [0xfa, 0xbf, 0xb5, 0xda],
                pow_limit_bits: CompactTarget::from_consensus(0x207fffff),
                no_retargeting: true,
                allow_min_difficulty_blocks: true,
                subsidy_halving_interval: 150,
                deployments: Deployments {
                    segwit_height: 0,
                    ..Deployments::always()
                },
            },
        }
    }

    /// Network these parameters describe.
    pub fn chain_type(&self) -> ChainType {
        self.chain_type
    }

    /// The hard-coded genesis block.
    pub fn genesis_block(&self) -> &Block {
        &self.genesis
    }

    /// Hash of the genesis block.
    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis.block_hash()
    }

    /// Four message-start bytes framing every record in block files.
    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    /// Easiest allowed target, in compact form.
    pub fn pow_limit_bits(&self) -> CompactTarget {
        self.pow_limit_bits
    }

    /// Easiest allowed target.
    pub fn pow_limit(&self) -> Target {
        Target::from_compact(self.pow_limit_bits)
    }

    /// Whether the difficulty never changes (regtest).
    pub fn no_retargeting(&self) -> bool {
        self.no_retargeting
    }

    /// Whether minimum-difficulty blocks are allowed after a 20 minute gap.
    pub fn allow_min_difficulty_blocks(&self) -> bool {
        self.allow_min_difficulty_blocks
    }

    /// Buried deployment heights.
    pub fn deployments(&self) -> &Deployments {
        &self.deployments
    }

    /// Block subsidy at `height`.
    pub fn block_subsidy(&self, height: i32) -> Amount {
        let halvings = height / self.subsidy_halving_interval;
        if halvings >= 64 {
            return Amount::ZERO;
        }
        Amount::from_sat(Amount::from_int_btc(50).to_sat() >> halvings)
    }

    /// Script verification flags enforced for a block at `height`.
    pub fn script_flags_at(&self, height: i32) -> ScriptVerificationFlags {
        let d = &self.deployments;
        let mut flags = ScriptVerificationFlags::NONE;
        if height > 0 {
            flags |= ScriptVerificationFlags::P2SH;
        }
        if height >= d.bip66_height {
            flags |= ScriptVerificationFlags::DERSIG;
        }
        if height >= d.bip65_height {
            flags |= ScriptVerificationFlags::CHECKLOCKTIMEVERIFY;
        }
        if height >= d.csv_height {
            flags |= ScriptVerificationFlags::CHECKSEQUENCEVERIFY;
        }
        if height >= d.segwit_height && height > 0 {
            flags |= ScriptVerificationFlags::WITNESS | ScriptVerificationFlags::NULLDUMMY;
        }
        if height >= d.taproot_height && height > 0 {
            flags |= ScriptVerificationFlags::TAPROOT;
        }
        flags
    }

    /// Minimum header version accepted at `height`.
    pub fn min_version_at(&self, height: i32) -> i32 {
        let d = &self.deployments;
        if height >= d.bip65_height {
            4
        } else if height >= d.bip66_height {
            3
        } else if height >= d.bip34_height {
            2
        } else {
            1
        }
    }

    /// Whether `height` starts a new difficulty period.
    pub fn is_retarget_height(&self, height: i32) -> bool {
        height % RETARGET_INTERVAL == 0
    }

    /// Network whose consensus `Params` drive retargeting.
    fn network(&self) -> Network {
        match self.chain_type {
            ChainType::Mainnet => Network::Bitcoin,
            ChainType::Testnet => Network::Testnet,
            ChainType::Testnet4 => Network::Testnet4,
            ChainType::Signet => Network::Signet,
            ChainType::Regtest => Network::Regtest,
        }
    }

    /// Whether a new period starts from the bits of its first block rather
    /// than its last (BIP94, testnet4).
    pub fn retarget_from_period_start(&self) -> bool {
        self.chain_type == ChainType::Testnet4
    }

    /// Bits for the first block of a difficulty period, scaling `bits` by
    /// how long the previous period took. The timespan is clamped to a
    /// quarter and four times the target and the result never exceeds the
    /// network limit.
    pub fn retarget_bits(&self, bits: CompactTarget, first_time: u32, last_time: u32) -> CompactTarget {
        if self.no_retargeting {
            return bits;
        }
        let timespan = i64::from(last_time) - i64::from(first_time);
        CompactTarget::from_next_work_required(bits, u64::try_from(timespan).unwrap_or(0), self.network())
    }
}

impl Deployments {
    /// Every deployment active from height 1.
    pub const fn always() -> Self {
        Self {
            bip34_height: 1,
            bip66_height: 1,
            bip65_height: 1,
            csv_height: 1,
            segwit_height: 1,
            taproot_height: 1,
        }
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::new(ChainType::Mainnet)
    }
}

fn testnet4_genesis() -> Block {
    // <0x1d00ffff> <4> <timestamp message>, the message needs OP_PUSHDATA1.
    let mut script_sig = vec![0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04, 0x4c];
    script_sig.push(TESTNET4_TIMESTAMP.len() as u8);
    script_sig.extend_from_slice(TESTNET4_TIMESTAMP.as_bytes());

    let mut script_pubkey = vec![0x21];
    script_pubkey.extend_from_slice(&[0u8; 33]);
    script_pubkey.push(0xac);

    let coinbase = Transaction {
        version: transaction::Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(script_sig),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_int_btc(50),
            script_pubkey: ScriptBuf::from_bytes(script_pubkey),
        }],
    };

    let merkle_root = TxMerkleNode::from_raw_hash(coinbase.compute_txid().to_raw_hash());
    Block {
        header: Header {
            version: Version::ONE,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root,
            time: 1_714_777_860,
            bits: CompactTarget::from_consensus(0x1d00ffff),
            nonce: 393_743_547,
        },
        txdata: vec![coinbase],
    }
}
