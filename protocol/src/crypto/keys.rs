//! # BLS Keys and Signatures
//!
//! Rollup users sign with BLS12-381 in the "minimal signature" layout:
//! signatures live in G1 (48 bytes compressed) and public keys in G2 (96
//! bytes compressed). Short signatures matter here because the commander
//! aggregates every transaction signature of a commitment into a single
//! 48-byte value that ends up in base-chain calldata.
//!
//! [`PublicKey`] and [`Signature`] are plain byte containers. They travel
//! through storage and the API unchanged and are only decoded into curve
//! points when something actually has to be verified, so a malformed key
//! stored in the account tree is a verification failure, not a crash.

use std::fmt;

use blst::min_sig;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::hash::keccak256;
use primitive_types::H256;

/// Compressed G2 public key length.
pub const PUBLIC_KEY_LENGTH: usize = 96;

/// Compressed G1 signature length.
pub const SIGNATURE_LENGTH: usize = 48;

/// Errors raised while handling key material.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key material")]
    InvalidSecretKey,

    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

// ---------------------------------------------------------------------------
// PublicKey
// ---------------------------------------------------------------------------

/// A compressed BLS public key as stored in the account tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; PUBLIC_KEY_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidLength {
                expected: PUBLIC_KEY_LENGTH,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Account-tree leaf hash of this key.
    pub fn hash(&self) -> H256 {
        keccak256(&self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight hex chars is plenty to tell keys apart in logs.
        write!(f, "PublicKey({}..)", &hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// A compressed BLS signature (single or aggregated).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; SIGNATURE_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidLength {
                expected: SIGNATURE_LENGTH,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", &hex::encode(&self.0[..4]))
    }
}

// Both types serialize as 0x-prefixed hex in human-readable formats (JSON)
// and as raw bytes in bincode.
macro_rules! impl_hex_serde {
    ($ty:ident) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_hex())
                } else {
                    serializer.serialize_bytes(&self.0)
                }
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    $ty::from_hex(&s).map_err(serde::de::Error::custom)
                } else {
                    let bytes: Vec<u8> = serde::de::Deserialize::deserialize(deserializer)?;
                    $ty::from_slice(&bytes).map_err(serde::de::Error::custom)
                }
            }
        }
    };
}

impl_hex_serde!(PublicKey);
impl_hex_serde!(Signature);

// ---------------------------------------------------------------------------
// BlsKeypair
// ---------------------------------------------------------------------------

/// A BLS secret key together with its public key.
///
/// Deliberately not serializable. The commander itself never signs user
/// transactions; keypairs exist for wallets, tooling and tests.
pub struct BlsKeypair {
    secret: min_sig::SecretKey,
    public: PublicKey,
}

impl BlsKeypair {
    /// Generate a keypair from OS randomness.
    pub fn generate() -> Result<Self, KeyError> {
        let mut ikm = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut ikm);
        Self::from_seed(&ikm)
    }

    /// Deterministically derive a keypair from 32 bytes of seed material.
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, KeyError> {
        let secret =
            min_sig::SecretKey::key_gen(seed, &[]).map_err(|_| KeyError::InvalidSecretKey)?;
        let public = PublicKey(secret.sk_to_pk().to_bytes());
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Sign `message` under the given domain separation tag.
    pub fn sign_raw(&self, message: &[u8], dst: &[u8]) -> Signature {
        Signature(self.secret.sign(message, dst, &[]).to_bytes())
    }
}

impl fmt::Debug for BlsKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlsKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
