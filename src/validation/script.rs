//! Script verification oracle.
//!
//! Script execution itself is delegated to an implementation of
//! [`ScriptVerifier`]; this module owns the flag vocabulary and the argument
//! checks that happen before the oracle is consulted.
use std::ops::{BitOr, BitOrAssign};

use bitcoin::{Amount, Script, Transaction, TxOut};
use thiserror::Error;

/// Script verification flags that may be combined with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScriptVerificationFlags(u32);

impl ScriptVerificationFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Evaluate P2SH (BIP16) subscripts.
    pub const P2SH: Self = Self(1 << 0);
    /// Enforce strict DER (BIP66).
    pub const DERSIG: Self = Self(1 << 2);
    /// Enforce NULLDUMMY (BIP147).
    pub const NULLDUMMY: Self = Self(1 << 4);
    /// CHECKLOCKTIMEVERIFY (BIP65).
    pub const CHECKLOCKTIMEVERIFY: Self = Self(1 << 9);
    /// CHECKSEQUENCEVERIFY (BIP112).
    pub const CHECKSEQUENCEVERIFY: Self = Self(1 << 10);
    /// Segregated witness (BIP141).
    pub const WITNESS: Self = Self(1 << 11);
    /// Taproot (BIPs 341 & 342).
    pub const TAPROOT: Self = Self(1 << 17);
    /// Every flag above.
    pub const ALL: Self = Self(
        Self::P2SH.0
            | Self::DERSIG.0
            | Self::NULLDUMMY.0
            | Self::CHECKLOCKTIMEVERIFY.0
            | Self::CHECKSEQUENCEVERIFY.0
            | Self::WITNESS.0
            | Self::TAPROOT.0,
    );

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits without checking them.
    pub const fn from_bits_retain(bits: u32) -> Self {
        Self(bits)
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ScriptVerificationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ScriptVerificationFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Reasons the oracle could not be asked at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScriptVerifyError {
    /// Flags outside [`ScriptVerificationFlags::ALL`].
    #[error("unknown script verification flags {0:#x}")]
    InvalidFlags(u32),
    /// Flags that cannot be combined (WITNESS requires P2SH).
    #[error("invalid script verification flag combination")]
    InvalidFlagsCombination,
    /// TAPROOT was requested without the spent outputs.
    #[error("taproot verification requires spent outputs")]
    SpentOutputsRequired,
    /// `input_index` is past the transaction's inputs.
    #[error("input index {index} out of range for {inputs} inputs")]
    InputOutOfRange {
        /// Offending index.
        index: usize,
        /// Number of inputs in the transaction.
        inputs: usize,
    },
}

/// An opaque script interpreter.
pub trait ScriptVerifier: Send + Sync {
    /// Verify input `input_index` of `tx` spending `script_pubkey`/`amount`.
    ///
    /// `spent_outputs` are all outputs spent by `tx` in input order; they may
    /// be empty for pre-taproot checks. Returns `Ok(false)` for a script
    /// that fails.
    fn verify(
        &self,
        script_pubkey: &Script,
        amount: Amount,
        tx: &Transaction,
        input_index: usize,
        spent_outputs: &[TxOut],
        flags: ScriptVerificationFlags,
    ) -> Result<bool, ScriptVerifyError>;
}

/// Accepts every script. Useful when signatures were checked elsewhere and
/// for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustingVerifier;

impl ScriptVerifier for TrustingVerifier {
    fn verify(
        &self,
        _script_pubkey: &Script,
        _amount: Amount,
        _tx: &Transaction,
        _input_index: usize,
        _spent_outputs: &[TxOut],
        _flags: ScriptVerificationFlags,
    ) -> Result<bool, ScriptVerifyError> {
        Ok(true)
    }
}

/// Check the arguments, then hand the input to `verifier`.
pub fn verify_script(
    verifier: &dyn ScriptVerifier,
    script_pubkey: &Script,
    amount: Amount,
    tx: &Transaction,
    input_index: usize,
    spent_outputs: &[TxOut],
    flags: ScriptVerificationFlags,
) -> Result<bool, ScriptVerifyError> {
    if flags.bits() & !ScriptVerificationFlags::ALL.bits() != 0 {
        return Err(ScriptVerifyError::InvalidFlags(flags.bits()));
    }
    if flags.contains(ScriptVerificationFlags::WITNESS)
        && !flags.contains(ScriptVerificationFlags::P2SH)
    {
        return Err(ScriptVerifyError::InvalidFlagsCombination);
    }
    if input_index >= tx.input.len() {
        return Err(ScriptVerifyError::InputOutOfRange {
            index: input_index,
            inputs: tx.input.len(),
        });
    }
    if flags.contains(ScriptVerificationFlags::TAPROOT) && spent_outputs.is_empty() {
        return Err(ScriptVerifyError::SpentOutputsRequired);
    }
    verifier.verify(script_pubkey, amount, tx, input_index, spent_outputs, flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{absolute::LockTime, transaction, OutPoint, ScriptBuf, Sequence, TxIn, Witness};

    fn one_input_tx() -> Transaction {
        Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![],
        }
    }

    #[test]
    fn witness_without_p2sh_is_rejected() {
        let tx = one_input_tx();
        let err = verify_script(
            &TrustingVerifier,
            &ScriptBuf::new(),
            Amount::ZERO,
            &tx,
            0,
            &[],
            ScriptVerificationFlags::WITNESS,
        )
        .unwrap_err();
        assert_eq!(err, ScriptVerifyError::InvalidFlagsCombination);
    }

    #[test]
    fn taproot_needs_spent_outputs() {
        let tx = one_input_tx();
        let err = verify_script(
            &TrustingVerifier,
            &ScriptBuf::new(),
            Amount::ZERO,
            &tx,
            0,
            &[],
            ScriptVerificationFlags::ALL,
        )
        .unwrap_err();
        assert_eq!(err, ScriptVerifyError::SpentOutputsRequired);
    }

    #[test]
    fn unknown_bits_and_bad_index_are_rejected() {
        let tx = one_input_tx();
        let bogus = ScriptVerificationFlags::from_bits_retain(1 << 30);
        assert_eq!(
            verify_script(&TrustingVerifier, &ScriptBuf::new(), Amount::ZERO, &tx, 0, &[], bogus),
            Err(ScriptVerifyError::InvalidFlags(1 << 30))
        );
        assert!(matches!(
            verify_script(
                &TrustingVerifier,
                &ScriptBuf::new(),
                Amount::ZERO,
                &tx,
                3,
                &[],
                ScriptVerificationFlags::P2SH
            ),
            Err(ScriptVerifyError::InputOutOfRange { index: 3, inputs: 1 })
        ));
    }

    #[test]
    fn valid_flags_reach_the_oracle() {
        let tx = one_input_tx();
        let ok = verify_script(
            &TrustingVerifier,
            &ScriptBuf::new(),
            Amount::ZERO,
            &tx,
            0,
            &[],
            ScriptVerificationFlags::P2SH | ScriptVerificationFlags::WITNESS,
        );
        assert_eq!(ok, Ok(true));
    }
}
