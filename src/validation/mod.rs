//! Validation outcomes and the consensus checks run by the engine.
use std::fmt;

pub(crate) mod checks;
pub mod script;

pub use script::{ScriptVerificationFlags, ScriptVerifier, ScriptVerifyError, TrustingVerifier};

/// Coarse result of validating a header or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationMode {
    /// Everything checked out.
    Valid,
    /// A consensus (or structural) rule was violated.
    Invalid,
    /// Processing failed for reasons unrelated to validity.
    InternalError,
}

/// Granular reason a block or header was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockValidationResult {
    /// Not rejected.
    Unset = 0,
    /// Invalid by consensus rules not covered below.
    Consensus = 1,
    /// Previously found invalid; the original reason was not kept.
    CachedInvalid = 2,
    /// Invalid proof of work, bits, version or time too old.
    InvalidHeader = 3,
    /// Block data does not match what the header commits to.
    Mutated = 4,
    /// Parent header unknown.
    MissingPrev = 5,
    /// An ancestor is invalid.
    InvalidPrev = 6,
    /// Timestamp more than two hours in the future.
    TimeFuture = 7,
    /// Header may be on a chain with too little work.
    HeaderLowWork = 8,
}

impl BlockValidationResult {
    /// Stable numeric code used in persisted records.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Unset,
            1 => Self::Consensus,
            2 => Self::CachedInvalid,
            3 => Self::InvalidHeader,
            4 => Self::Mutated,
            5 => Self::MissingPrev,
            6 => Self::InvalidPrev,
            7 => Self::TimeFuture,
            8 => Self::HeaderLowWork,
            _ => return None,
        })
    }
}

/// Result of validating a header or block: mode, reason and a short
/// reject string (`"high-hash"`, `"bad-txnmrklroot"`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockValidationState {
    mode: ValidationMode,
    result: BlockValidationResult,
    reject_reason: String,
    debug_message: String,
}

impl BlockValidationState {
    /// A valid state.
    pub fn valid() -> Self {
        Self {
            mode: ValidationMode::Valid,
            result: BlockValidationResult::Unset,
            reject_reason: String::new(),
            debug_message: String::new(),
        }
    }

    /// An invalid state carrying `result`.
    pub fn invalid(result: BlockValidationResult, reject_reason: impl Into<String>) -> Self {
        Self {
            mode: ValidationMode::Invalid,
            result,
            reject_reason: reject_reason.into(),
            debug_message: String::new(),
        }
    }

    /// An internal-error state.
    pub fn error(reject_reason: impl Into<String>) -> Self {
        Self {
            mode: ValidationMode::InternalError,
            result: BlockValidationResult::Unset,
            reject_reason: reject_reason.into(),
            debug_message: String::new(),
        }
    }

    /// Attach extra detail for logs.
    pub fn with_debug(mut self, msg: impl Into<String>) -> Self {
        self.debug_message = msg.into();
        self
    }

    /// Coarse mode.
    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    /// Granular reason (`Unset` when valid).
    pub fn result(&self) -> BlockValidationResult {
        self.result
    }

    /// Short reject string.
    pub fn reject_reason(&self) -> &str {
        &self.reject_reason
    }

    /// Extra detail, possibly empty.
    pub fn debug_message(&self) -> &str {
        &self.debug_message
    }

    /// `mode() == Valid`.
    pub fn is_valid(&self) -> bool {
        self.mode == ValidationMode::Valid
    }

    /// `mode() == Invalid`.
    pub fn is_invalid(&self) -> bool {
        self.mode == ValidationMode::Invalid
    }

    /// `mode() == InternalError`.
    pub fn is_error(&self) -> bool {
        self.mode == ValidationMode::InternalError
    }
}

impl Default for BlockValidationState {
    fn default() -> Self {
        Self::valid()
    }
}

impl fmt::Display for BlockValidationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            ValidationMode::Valid => write!(f, "Valid"),
            _ if self.debug_message.is_empty() => write!(f, "{}", self.reject_reason),
            _ => write!(f, "{}, {}", self.reject_reason, self.debug_message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes_roundtrip() {
        for code in 0..=8u8 {
            let r = BlockValidationResult::from_code(code).unwrap();
            assert_eq!(r.code(), code);
        }
        assert!(BlockValidationResult::from_code(9).is_none());
    }

    #[test]
    fn display_includes_debug_detail() {
        let state = BlockValidationState::invalid(BlockValidationResult::Consensus, "bad-cb-amount")
            .with_debug("coinbase pays too much");
        assert!(state.is_invalid());
        assert_eq!(state.to_string(), "bad-cb-amount, coinbase pays too much");
        assert_eq!(BlockValidationState::valid().to_string(), "Valid");
    }
}
