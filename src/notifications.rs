//! Observer traits the engine reports through.
//!
//! Both traits are called synchronously while the engine holds its state
//! lock: handlers must return quickly and must not call back into the
//! [`ChainstateManager`](crate::ChainstateManager).
use bitcoin::Block;

use crate::index::EntryRef;
use crate::validation::BlockValidationState;

/// Phase of synchronization reported with tip updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SynchronizationState {
    /// Rebuilding from local block files.
    InitReindex,
    /// Initial block download.
    InitDownload,
    /// Caught up.
    PostInit,
}

/// Conditions the node operator should be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Warning {
    /// Recent blocks signal version bits this software does not know.
    UnknownNewRulesActivated,
    /// An invalid chain with much more work than ours exists.
    LargeWorkInvalidChain,
}

/// Lifecycle notifications. Every method defaults to a no-op.
pub trait KernelNotifications: Send + Sync {
    /// The active chain tip changed.
    fn block_tip(&self, _state: SynchronizationState, _entry: EntryRef<'_>, _verification_progress: f64) {}

    /// A new best header was accepted.
    fn header_tip(&self, _state: SynchronizationState, _height: i32, _timestamp: u32, _presync: bool) {}

    /// Long running work (reindex, import) advanced.
    fn progress(&self, _title: &str, _percent: i32, _resume_possible: bool) {}

    /// A warning became active.
    fn warning_set(&self, _warning: Warning, _message: &str) {}

    /// A warning is no longer active.
    fn warning_unset(&self, _warning: Warning) {}

    /// Writing state to disk failed; the in-memory state is still usable.
    fn flush_error(&self, _message: &str) {}

    /// Unrecoverable failure. The caller should shut down.
    fn fatal_error(&self, _message: &str) {}
}

/// Block-level validation events.
pub trait ValidationInterface: Send + Sync {
    /// Full validation of `block` finished with `state`.
    fn block_checked(&self, _block: &Block, _state: &BlockValidationState) {}

    /// `block` has valid proof of work and extends the current tip.
    fn pow_valid_block(&self, _block: &Block, _entry: EntryRef<'_>) {}

    /// `block` was connected to the active chain.
    fn block_connected(&self, _block: &Block, _entry: EntryRef<'_>) {}

    /// `block` was disconnected from the active chain.
    fn block_disconnected(&self, _block: &Block, _entry: EntryRef<'_>) {}
}

/// Sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifications;

impl KernelNotifications for NoopNotifications {}

impl ValidationInterface for NoopNotifications {}
