//! Transaction construction via the builder pattern.
//!
//! The [`TransactionBuilder`] is what wallets, tooling and tests use to
//! assemble a [`Transaction`]. `build()` yields an unsigned transaction with
//! its hash filled in; `sign()` additionally signs the exact signing message
//! the validator checks.

use chrono::{DateTime, Utc};
use primitive_types::U256;

use super::encoding::{hash_transaction, signing_message};
use super::types::{Create2Transfer, MassMigration, Transaction, Transfer, TxBase, TxType};
use crate::crypto::{sign, BlsKeypair, PublicKey, Signature, SigningDomain};

#[derive(Debug, Clone)]
enum Target {
    State(u32),
    PublicKey(PublicKey),
    Spoke(u32),
}

/// Fluent builder for [`Transaction`] values.
///
/// # Usage
///
/// ```rust
/// use rollup_protocol::crypto::{BlsKeypair, SigningDomain};
/// use rollup_protocol::transaction::TransactionBuilder;
///
/// let keypair = BlsKeypair::from_seed(&[7u8; 32]).unwrap();
/// let tx = TransactionBuilder::transfer(0, 1)
///     .amount(50)
///     .fee(10)
///     .nonce(0)
///     .sign(&keypair, &SigningDomain::default());
/// assert_eq!(tx.from_state_id(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    from_state_id: u32,
    target: Target,
    amount: U256,
    fee: U256,
    nonce: U256,
    received_at: Option<DateTime<Utc>>,
}

impl TransactionBuilder {
    fn new(from_state_id: u32, target: Target) -> Self {
        Self {
            from_state_id,
            target,
            amount: U256::zero(),
            fee: U256::zero(),
            nonce: U256::zero(),
            received_at: None,
        }
    }

    pub fn transfer(from_state_id: u32, to_state_id: u32) -> Self {
        Self::new(from_state_id, Target::State(to_state_id))
    }

    pub fn create2transfer(from_state_id: u32, to_public_key: PublicKey) -> Self {
        Self::new(from_state_id, Target::PublicKey(to_public_key))
    }

    pub fn mass_migration(from_state_id: u32, spoke_id: u32) -> Self {
        Self::new(from_state_id, Target::Spoke(spoke_id))
    }

    pub fn tx_type(&self) -> TxType {
        match self.target {
            Target::State(_) => TxType::Transfer,
            Target::PublicKey(_) => TxType::Create2Transfer,
            Target::Spoke(_) => TxType::MassMigration,
        }
    }

    pub fn amount(mut self, amount: impl Into<U256>) -> Self {
        self.amount = amount.into();
        self
    }

    pub fn fee(mut self, fee: impl Into<U256>) -> Self {
        self.fee = fee.into();
        self
    }

    pub fn nonce(mut self, nonce: impl Into<U256>) -> Self {
        self.nonce = nonce.into();
        self
    }

    /// Overrides the arrival time. Defaults to now.
    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = Some(at);
        self
    }

    /// Unsigned transaction (all-zero signature) with its hash computed.
    pub fn build(self) -> Transaction {
        let base = TxBase {
            hash: Default::default(),
            from_state_id: self.from_state_id,
            amount: self.amount,
            fee: self.fee,
            nonce: self.nonce,
            signature: Signature([0u8; crate::crypto::keys::SIGNATURE_LENGTH]),
            received_at: self.received_at.unwrap_or_else(Utc::now),
        };
        let mut tx = match self.target {
            Target::State(to_state_id) => Transaction::Transfer(Transfer { base, to_state_id }),
            Target::PublicKey(to_public_key) => Transaction::Create2Transfer(Create2Transfer {
                base,
                to_public_key,
                to_state_id: None,
                to_pub_key_id: None,
            }),
            Target::Spoke(spoke_id) => Transaction::MassMigration(MassMigration { base, spoke_id }),
        };
        tx.base_mut().hash = hash_transaction(&tx);
        tx
    }

    /// Build and sign with `keypair` under `domain`.
    pub fn sign(self, keypair: &BlsKeypair, domain: &SigningDomain) -> Transaction {
        let mut tx = self.build();
        sign_transaction(&mut tx, keypair, domain);
        tx
    }
}

/// Sign `tx` in place. The hash does not cover the signature, so it stays
/// valid.
pub fn sign_transaction(tx: &mut Transaction, keypair: &BlsKeypair, domain: &SigningDomain) {
    let signature = sign(keypair, domain, &signing_message(tx));
    tx.base_mut().signature = signature;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify;

    #[test]
    fn builder_produces_deterministic_hash() {
        let at = Utc::now();
        let a = TransactionBuilder::transfer(0, 1).amount(50).fee(10).received_at(at).build();
        let b = TransactionBuilder::transfer(0, 1).amount(50).fee(10).received_at(at).build();
        assert_eq!(a.hash(), b.hash());
        assert!(!a.hash().is_zero());
    }

    #[test]
    fn constructors_pick_the_variant() {
        let key = BlsKeypair::from_seed(&[3; 32]).unwrap().public_key();
        assert_eq!(TransactionBuilder::transfer(0, 1).build().tx_type(), TxType::Transfer);
        assert_eq!(
            TransactionBuilder::create2transfer(0, key).build().tx_type(),
            TxType::Create2Transfer
        );
        assert_eq!(
            TransactionBuilder::mass_migration(0, 1).build().tx_type(),
            TxType::MassMigration
        );
    }

    #[test]
    fn signature_covers_signing_message() {
        let kp = BlsKeypair::from_seed(&[1; 32]).unwrap();
        let domain = SigningDomain::default();
        let tx = TransactionBuilder::mass_migration(2, 1)
            .amount(90)
            .fee(10)
            .nonce(4)
            .sign(&kp, &domain);
        verify(
            &kp.public_key(),
            &domain,
            &signing_message(&tx),
            &tx.base().signature,
        )
        .unwrap();
    }

    #[test]
    fn signing_keeps_hash() {
        let kp = BlsKeypair::from_seed(&[1; 32]).unwrap();
        let unsigned = TransactionBuilder::transfer(0, 1).amount(1).build();
        let mut signed = unsigned.clone();
        sign_transaction(&mut signed, &kp, &SigningDomain::default());
        assert_eq!(unsigned.hash(), signed.hash());
        assert_ne!(unsigned.base().signature, signed.base().signature);
    }
}
