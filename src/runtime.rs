//! Async wrapper for use inside a tokio runtime.
//!
//! Engine calls block on disk and CPU work, so each one runs on tokio's
//! blocking pool instead of stalling the async workers.
use std::path::PathBuf;
use std::sync::Arc;

use bitcoin::{block::Header, Block, BlockHash};

use crate::engine::{ChainstateManager, ProcessBlockOutcome};
use crate::error::{KernelError, KernelResult};
use crate::import::ImportStats;
use crate::validation::BlockValidationState;

/// Shareable async handle to a [`ChainstateManager`].
#[derive(Debug, Clone)]
pub struct AsyncChainstate {
    inner: Arc<ChainstateManager>,
}

impl AsyncChainstate {
    /// Take ownership of `manager`.
    pub fn new(manager: ChainstateManager) -> Self {
        Self::from_arc(Arc::new(manager))
    }

    /// Share an existing manager.
    pub fn from_arc(inner: Arc<ChainstateManager>) -> Self {
        Self { inner }
    }

    /// The wrapped manager, for synchronous reads.
    pub fn manager(&self) -> &Arc<ChainstateManager> {
        &self.inner
    }

    /// See [`ChainstateManager::process_block_header`].
    pub async fn process_block_header(&self, header: Header) -> KernelResult<BlockValidationState> {
        self.run(move |m| m.process_block_header(&header)).await
    }

    /// See [`ChainstateManager::process_block`].
    pub async fn process_block(&self, block: Block) -> KernelResult<ProcessBlockOutcome> {
        self.run(move |m| m.process_block(&block)).await
    }

    /// See [`ChainstateManager::import_blocks`].
    pub async fn import_blocks(&self, paths: Vec<PathBuf>) -> KernelResult<ImportStats> {
        self.run(move |m| m.import_blocks(&paths)).await
    }

    /// Height and hash of the active tip.
    pub async fn tip(&self) -> KernelResult<Option<(i32, BlockHash)>> {
        self.run(|m| {
            let guard = m.read()?;
            Ok(guard.chain().tip().map(|e| (e.height(), e.block_hash())))
        })
        .await
    }

    async fn run<T, F>(&self, f: F) -> KernelResult<T>
    where
        F: FnOnce(&ChainstateManager) -> KernelResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| KernelError::Internal(format!("blocking task failed: {e}")))?
    }
}
