#![forbid(unsafe_code)]
#![deny(missing_docs)]
//! blocktree-kernel: a block-tree indexed chain validation store for
//! Bitcoin-family chains.
//!
//! ## What you provide
//! - A [`Context`] built from [`ContextOptions`]: the network, and optionally
//!   [`KernelNotifications`] and [`ValidationInterface`] observers.
//! - Optionally a [`ScriptVerifier`]: script execution is an oracle; the
//!   default [`TrustingVerifier`] accepts every input.
//!
//! ## What the kernel does
//! - Keeps every header seen in a [`BlockIndex`] with its validation status
//!   and cumulative work.
//! - Stores blocks and undo data in flat files ([`BlockStore`]).
//! - Connects and disconnects blocks against the UTXO set, always moving the
//!   active chain to the most-work valid tip.
//! - Persists the block tree and coins through a [`KvStore`] (SQLite by
//!   default) and resumes from them on restart.
//!
//! ## Minimal usage
//! ```rust,no_run
//! use blocktree_kernel::prelude::*;
//!
//! fn run(block: &bitcoin::Block) -> Result<(), KernelError> {
//!     let ctx = ContextOptions::new().with_chain_type(ChainType::Regtest).build();
//!     let options = ChainstateManagerOptions::new(&ctx, "/tmp/kernel", "/tmp/kernel/blocks")
//!         .with_worker_threads(2);
//!     let manager = ChainstateManager::new(options)?;
//!
//!     let outcome = manager.process_block(block)?;
//!     println!("new: {}, state: {}", outcome.new_block, outcome.state);
//!
//!     let chain = manager.read()?;
//!     if let Some(tip) = chain.chain().tip() {
//!         println!("tip {} at {}", tip.block_hash(), tip.height());
//!     }
//!     Ok(())
//! }
//! ```

/// Flat-file storage of blocks and undo data.
pub mod blockstore;

/// Per-network consensus parameters.
pub mod chainparams;

/// Consensus wire encoding helpers.
pub mod codec;

/// Coins, the UTXO set and undo records.
pub mod coins;

/// Shared context: chain parameters, observers, interrupt flag.
pub mod context;

/// The validation engine.
pub mod engine;

/// Error types.
pub mod error;

/// Reindex and block-file import.
pub mod import;

/// Block tree and active chain.
pub mod index;

/// Callback-based log routing.
pub mod logging;

/// Observer traits.
pub mod notifications;

/// Async wrapper over the engine.
#[cfg(feature = "runtime")]
pub mod runtime;

/// Persistence layer (key-value trait, SQLite and in-memory stores).
pub mod store;

/// Validation results and the script oracle.
pub mod validation;

// Public re-exports
pub use blockstore::{BlockStore, FlatFilePos};
pub use chainparams::{ChainParams, ChainType};
pub use coins::{BlockUndo, Coin, TxUndo, UtxoSet};
pub use context::{Context, ContextOptions};
pub use engine::{ChainstateManager, ChainstateManagerOptions, ChainstateReadGuard, ProcessBlockOutcome};
pub use error::{IndexError, KernelError, KernelResult, StoreError};
pub use import::ImportStats;
pub use index::{ActiveChain, BlockIndex, BlockStatus, ChainView, EntryId, EntryRef, FailureReason};
pub use logging::{LogCategory, LogLevel, LoggingConnection, LoggingOptions};
pub use notifications::{
    KernelNotifications, NoopNotifications, SynchronizationState, ValidationInterface, Warning,
};
#[cfg(feature = "runtime")]
pub use runtime::AsyncChainstate;
pub use store::{KvStore, MemoryStore, WriteBatch};
#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;
pub use validation::{
    BlockValidationResult, BlockValidationState, ScriptVerificationFlags, ScriptVerifier, ScriptVerifyError,
    TrustingVerifier, ValidationMode,
};

/// Convenience prelude for end users.
pub mod prelude {
    pub use crate::{
        BlockStatus, BlockValidationResult, BlockValidationState, ChainType, ChainstateManager,
        ChainstateManagerOptions, Context, ContextOptions, EntryRef, KernelError, KernelNotifications,
        KvStore, ValidationInterface,
    };
}
