//! # Cryptographic Primitives
//!
//! Two concerns live here and nothing else:
//!
//! - **Keccak-256** hashing with ABI-style word encoding, because the base
//!   chain recomputes every root we publish.
//! - **BLS12-381** keys, signatures and aggregation, because a commitment
//!   carries exactly one combined signature for all of its transactions.
//!
//! Everything is a thin wrapper over `sha3` and `blst`. Nothing in this
//! module touches storage.

pub mod hash;
pub mod keys;
pub mod signatures;

pub use hash::{hash_two, keccak256, keccak256_multi};
pub use keys::{BlsKeypair, PublicKey, Signature};
pub use signatures::{aggregate, sign, verify, verify_aggregate, SignatureError, SigningDomain};
