//! Consensus wire encoding for headers, blocks, transactions and the rest
//! of the `bitcoin` data types, as bytes or hex.
use bitcoin::consensus::{self, Decodable, Encodable};

use crate::error::{KernelError, KernelResult};

/// Canonical serialization of `value`.
pub fn encode<T: Encodable + ?Sized>(value: &T) -> Vec<u8> {
    consensus::serialize(value)
}

/// Parse `bytes`; trailing data is an error.
pub fn decode<T: Decodable>(bytes: &[u8]) -> KernelResult<T> {
    Ok(consensus::deserialize(bytes)?)
}

/// [`encode`] as lowercase hex.
pub fn encode_hex<T: Encodable + ?Sized>(value: &T) -> String {
    hex::encode(encode(value))
}

/// [`decode`] from hex.
pub fn decode_hex<T: Decodable>(s: &str) -> KernelResult<T> {
    let bytes = hex::decode(s.trim()).map_err(|e| KernelError::InvalidOptions(format!("bad hex: {e}")))?;
    decode(&bytes)
}
