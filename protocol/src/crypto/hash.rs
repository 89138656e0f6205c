//! # Hashing Utilities
//!
//! Everything the rollup commits to on the base chain is hashed with
//! Keccak-256. That is not a matter of taste: the on-chain verifier
//! recomputes state roots, body hashes and withdraw roots with the EVM's
//! `keccak256` opcode, so any other function would produce roots nobody can
//! check.
//!
//! Two encodings show up over and over:
//!
//! - **ABI words** — every integer widened to a 32-byte big-endian word, the
//!   same layout `abi.encode` produces. Leaf payloads and transaction hashes
//!   use this.
//! - **Packed bytes** — fields concatenated at their natural width, matching
//!   `abi.encodePacked`. Commitment calldata and body hashes use this.

use primitive_types::{H256, U256};
use sha3::{Digest, Keccak256};

/// Keccak-256 of arbitrary bytes.
///
/// # Example
///
/// ```
/// use rollup_protocol::crypto::keccak256;
///
/// let empty = keccak256(b"");
/// assert_eq!(
///     hex::encode(empty.as_bytes()),
///     "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
/// );
/// ```
pub fn keccak256(data: &[u8]) -> H256 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    H256::from_slice(&hasher.finalize())
}

/// Keccak-256 over several byte slices, without concatenating them first.
pub fn keccak256_multi(parts: &[&[u8]]) -> H256 {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    H256::from_slice(&hasher.finalize())
}

/// Parent hash of two Merkle children: `keccak(left ‖ right)`.
pub fn hash_two(left: &H256, right: &H256) -> H256 {
    keccak256_multi(&[left.as_bytes(), right.as_bytes()])
}

/// Widen a `U256` to its 32-byte big-endian ABI word.
pub fn u256_word(value: &U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

/// Widen a `u32` to a 32-byte big-endian ABI word.
pub fn u32_word(value: u32) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[28..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Accumulates ABI words and hashes them in one go.
///
/// ```
/// use primitive_types::U256;
/// use rollup_protocol::crypto::hash::AbiEncoder;
///
/// let bytes = AbiEncoder::new().u32(7).u256(&U256::from(9)).into_bytes();
/// assert_eq!(bytes.len(), 64);
/// ```
#[derive(Debug, Default, Clone)]
pub struct AbiEncoder {
    buf: Vec<u8>,
}

impl AbiEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.buf.extend_from_slice(&u32_word(value));
        self
    }

    pub fn u256(mut self, value: &U256) -> Self {
        self.buf.extend_from_slice(&u256_word(value));
        self
    }

    pub fn h256(mut self, value: &H256) -> Self {
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn hash(self) -> H256 {
        keccak256(&self.buf)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_of_zero_word_matches_known_constant() {
        // keccak256(abi.encode(0)), the empty-leaf hash of every tree.
        let h = keccak256(&[0u8; 32]);
        assert_eq!(
            hex::encode(h.as_bytes()),
            "290decd9548b62a8d60345a988386fc84ba6bc95484008f6362f93160ef3e563"
        );
    }

    #[test]
    fn multi_part_hash_equals_concatenated_hash() {
        let a = [1u8; 40];
        let b = [2u8; 7];
        let mut joined = a.to_vec();
        joined.extend_from_slice(&b);
        assert_eq!(keccak256_multi(&[&a, &b]), keccak256(&joined));
    }

    #[test]
    fn hash_two_is_order_sensitive() {
        let l = H256::repeat_byte(1);
        let r = H256::repeat_byte(2);
        assert_ne!(hash_two(&l, &r), hash_two(&r, &l));
    }

    #[test]
    fn words_are_big_endian_and_left_padded() {
        let w = u32_word(0x0102_0304);
        assert_eq!(&w[..28], &[0u8; 28]);
        assert_eq!(&w[28..], &[1, 2, 3, 4]);

        let w = u256_word(&U256::from(0x0102u64));
        assert_eq!(w[30], 1);
        assert_eq!(w[31], 2);
    }

    #[test]
    fn abi_encoder_concatenates_words() {
        let bytes = AbiEncoder::new()
            .u32(1)
            .u256(&U256::from(2))
            .h256(&H256::repeat_byte(3))
            .into_bytes();
        assert_eq!(bytes.len(), 96);
        assert_eq!(bytes[31], 1);
        assert_eq!(bytes[63], 2);
        assert_eq!(bytes[64], 3);
    }
}
