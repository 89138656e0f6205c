//! # Signing Domain, Verification and Aggregation
//!
//! Every rollup deployment has its own 32-byte signing domain, fixed by the
//! rollup contract. It is used as the hash-to-curve domain separation tag,
//! so a signature produced for one deployment is worthless on another.
//!
//! Verification never panics on garbage: undecodable keys or signatures
//! are reported as [`SignatureError`] values and the caller decides what a
//! failure means for the transaction at hand.

use blst::{min_sig, BLST_ERROR};
use primitive_types::H256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::keys::{BlsKeypair, PublicKey, Signature};

/// Errors during signature operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature verification failed")]
    VerificationFailed,

    #[error("invalid signature bytes")]
    InvalidSignatureBytes,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("cannot aggregate an empty signature set")]
    EmptyAggregate,

    #[error("message count {messages} does not match key count {keys}")]
    LengthMismatch { messages: usize, keys: usize },
}

/// Domain separation tag for a rollup deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningDomain(pub H256);

impl SigningDomain {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Default for SigningDomain {
    fn default() -> Self {
        Self(H256::zero())
    }
}

/// Sign `message` for `domain`.
pub fn sign(keypair: &BlsKeypair, domain: &SigningDomain, message: &[u8]) -> Signature {
    keypair.sign_raw(message, domain.as_bytes())
}

/// Verify a single signature.
pub fn verify(
    public_key: &PublicKey,
    domain: &SigningDomain,
    message: &[u8],
    signature: &Signature,
) -> Result<(), SignatureError> {
    let pk = decode_public_key(public_key)?;
    let sig = decode_signature(signature)?;
    match sig.verify(true, message, domain.as_bytes(), &[], &pk, true) {
        BLST_ERROR::BLST_SUCCESS => Ok(()),
        _ => Err(SignatureError::VerificationFailed),
    }
}

/// Aggregate signatures into the commitment's combined signature.
pub fn aggregate(signatures: &[Signature]) -> Result<Signature, SignatureError> {
    if signatures.is_empty() {
        return Err(SignatureError::EmptyAggregate);
    }
    let decoded = signatures
        .iter()
        .map(decode_signature)
        .collect::<Result<Vec<_>, _>>()?;
    let refs: Vec<&min_sig::Signature> = decoded.iter().collect();
    let agg = min_sig::AggregateSignature::aggregate(&refs, true)
        .map_err(|_| SignatureError::InvalidSignatureBytes)?;
    Ok(Signature(agg.to_signature().to_bytes()))
}

/// Verify an aggregate over distinct `(public_key, message)` pairs.
pub fn verify_aggregate(
    public_keys: &[PublicKey],
    domain: &SigningDomain,
    messages: &[Vec<u8>],
    signature: &Signature,
) -> Result<(), SignatureError> {
    if public_keys.len() != messages.len() {
        return Err(SignatureError::LengthMismatch {
            messages: messages.len(),
            keys: public_keys.len(),
        });
    }
    if public_keys.is_empty() {
        return Err(SignatureError::EmptyAggregate);
    }
    let keys = public_keys
        .iter()
        .map(decode_public_key)
        .collect::<Result<Vec<_>, _>>()?;
    let key_refs: Vec<&min_sig::PublicKey> = keys.iter().collect();
    let msg_refs: Vec<&[u8]> = messages.iter().map(Vec::as_slice).collect();
    let sig = decode_signature(signature)?;

    match sig.aggregate_verify(true, &msg_refs, domain.as_bytes(), &key_refs, true) {
        BLST_ERROR::BLST_SUCCESS => Ok(()),
        _ => Err(SignatureError::VerificationFailed),
    }
}

fn decode_public_key(pk: &PublicKey) -> Result<min_sig::PublicKey, SignatureError> {
    min_sig::PublicKey::from_bytes(pk.as_bytes()).map_err(|_| SignatureError::InvalidPublicKey)
}

fn decode_signature(sig: &Signature) -> Result<min_sig::Signature, SignatureError> {
    min_sig::Signature::from_bytes(sig.as_bytes())
        .map_err(|_| SignatureError::InvalidSignatureBytes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
