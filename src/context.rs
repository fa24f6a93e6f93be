//! Shared kernel context: chain parameters, observers and the interrupt flag.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::chainparams::{ChainParams, ChainType};
use crate::notifications::{KernelNotifications, NoopNotifications, ValidationInterface};

/// Builder for [`Context`].
///
/// ```
/// use blocktree_kernel::{ChainType, ContextOptions};
///
/// let ctx = ContextOptions::new().with_chain_type(ChainType::Regtest).build();
/// assert_eq!(ctx.chain_params().chain_type(), ChainType::Regtest);
/// ```
pub struct ContextOptions {
    chain_params: ChainParams,
    notifications: Arc<dyn KernelNotifications>,
    validation: Arc<dyn ValidationInterface>,
}

impl ContextOptions {
    /// Mainnet parameters, no observers.
    pub fn new() -> Self {
        Self {
            chain_params: ChainParams::default(),
            notifications: Arc::new(NoopNotifications),
            validation: Arc::new(NoopNotifications),
        }
    }

    /// Use these chain parameters.
    pub fn with_chain_params(mut self, params: ChainParams) -> Self {
        self.chain_params = params;
        self
    }

    /// Shorthand for the built-in parameters of `chain_type`.
    pub fn with_chain_type(self, chain_type: ChainType) -> Self {
        self.with_chain_params(ChainParams::new(chain_type))
    }

    /// Receive kernel notifications.
    pub fn with_notifications(mut self, notifications: Arc<dyn KernelNotifications>) -> Self {
        self.notifications = notifications;
        self
    }

    /// Receive validation events.
    pub fn with_validation_interface(mut self, validation: Arc<dyn ValidationInterface>) -> Self {
        self.validation = validation;
        self
    }

    /// Finish.
    pub fn build(self) -> Context {
        Context {
            inner: Arc::new(ContextInner {
                chain_params: self.chain_params,
                notifications: self.notifications,
                validation: self.validation,
                interrupted: AtomicBool::new(false),
            }),
        }
    }
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self::new()
    }
}

struct ContextInner {
    chain_params: ChainParams,
    notifications: Arc<dyn KernelNotifications>,
    validation: Arc<dyn ValidationInterface>,
    interrupted: AtomicBool,
}

/// Cheap to clone; clones share observers and the interrupt flag.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

static GLOBAL: OnceLock<Context> = OnceLock::new();

impl Context {
    /// Process-wide default context (mainnet, no observers), created on
    /// first use.
    pub fn global() -> &'static Context {
        GLOBAL.get_or_init(|| ContextOptions::new().build())
    }

    /// Chain parameters.
    pub fn chain_params(&self) -> &ChainParams {
        &self.inner.chain_params
    }

    /// Kernel notification sink.
    pub fn notifications(&self) -> &dyn KernelNotifications {
        self.inner.notifications.as_ref()
    }

    /// Validation event sink.
    pub fn validation_interface(&self) -> &dyn ValidationInterface {
        self.inner.validation.as_ref()
    }

    /// Ask long running operations to stop at the next checkpoint.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
    }

    /// Whether [`interrupt`](Self::interrupt) was called.
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Clear the interrupt flag.
    pub fn reset_interrupt(&self) {
        self.inner.interrupted.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("chain", &self.inner.chain_params.chain_type())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_interrupt_flag() {
        let ctx = ContextOptions::new().with_chain_type(ChainType::Signet).build();
        let other = ctx.clone();
        assert!(!other.is_interrupted());
        ctx.interrupt();
        assert!(other.is_interrupted());
        other.reset_interrupt();
        assert!(!ctx.is_interrupted());
    }

    #[test]
    fn global_context_is_mainnet_and_stable() {
        let a = Context::global();
        let b = Context::global();
        assert!(std::ptr::eq(a, b));
        assert_eq!(a.chain_params().chain_type(), ChainType::Mainnet);
    }
}
