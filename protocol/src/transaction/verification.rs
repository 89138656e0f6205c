//! Admission checks for incoming transactions.
//!
//! Every transaction entering the mempool must pass [`validate`]. The checks
//! are ordered from cheapest to most expensive (field arithmetic before
//! storage reads, storage reads before pairing checks) and the first
//! failure wins. Nothing here writes: the caller queues the transaction in
//! the same write transaction once it has passed.

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use super::encoding::{is_decimal_encodable, signing_message};
use super::types::Transaction;
use crate::crypto::{verify, SigningDomain};
use crate::error::{CommanderError, CommanderResult, DecimalField};
use crate::mempool::Mempool;
use crate::storage::account_tree::AccountTree;
use crate::storage::db::KvRead;
use crate::storage::spoke_exists;
use crate::storage::state_tree::{StateTree, UserState};

/// Knobs of the admission policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    /// Smallest fee accepted. Zero admits free transactions.
    pub min_fee: U256,
    /// Skip signature checks. Only for tests and bootstrap tooling.
    pub disable_signatures: bool,
    pub signing_domain: SigningDomain,
}

/// Validate `tx` against committed state plus the sender's queue.
///
/// The checks, in order:
///
/// 1. **Amount** must be positive; **fee** must reach `min_fee`.
/// 2. **Decimal encoding**: amount, then fee, must fit the calldata format.
/// 3. **Sender** state leaf must exist.
/// 4. **Nonce** must equal the sender's pending nonce exactly.
/// 5. **Balance**: the pending balance must cover `amount + fee`.
/// 6. **Type-specific**: no transfer to self and the receiver must exist;
///    a create-and-transfer destination key must not already own a state
///    for the sender's token; a mass migration needs a registered spoke
///    and a nonce that fits the 4-byte field of its signing message.
/// 7. **Signature** against the sender's registered key, unless disabled.
pub fn validate<S: KvRead>(
    store: &S,
    tx: &Transaction,
    config: &ValidationConfig,
) -> CommanderResult<()> {
    let base = tx.base();

    // 1. Amount and fee.
    if base.amount.is_zero() {
        return Err(CommanderError::InvalidAmount);
    }
    if base.fee < config.min_fee {
        return Err(CommanderError::FeeTooLow {
            min: config.min_fee,
            got: base.fee,
        });
    }

    // 2. Calldata representability.
    if !is_decimal_encodable(&base.amount) {
        return Err(CommanderError::NotDecimalEncodable(DecimalField::Amount));
    }
    if !is_decimal_encodable(&base.fee) {
        return Err(CommanderError::NotDecimalEncodable(DecimalField::Fee));
    }

    // 3. Sender.
    let states = StateTree::new(store);
    let sender = states
        .try_leaf(base.from_state_id)?
        .ok_or(CommanderError::NonexistentSender(base.from_state_id))?;

    // 4. Nonce.
    let mempool = Mempool::new(store);
    let pending = mempool.pending_state(base.from_state_id)?;
    if base.nonce < pending.nonce {
        return Err(CommanderError::NonceTooLow {
            expected: pending.nonce,
            got: base.nonce,
        });
    }
    if base.nonce > pending.nonce {
        return Err(CommanderError::NonceTooHigh {
            expected: pending.nonce,
            got: base.nonce,
        });
    }

    // 5. Balance.
    let required = tx.total_cost()?;
    if pending.balance < required {
        return Err(CommanderError::InsufficientBalance {
            required,
            available: pending.balance,
        });
    }

    // 6. Type-specific.
    validate_target(store, tx, &sender)?;

    // 7. Signature.
    if config.disable_signatures {
        return Ok(());
    }
    let account = AccountTree::new(store)
        .try_leaf(sender.pub_key_id)?
        .ok_or(CommanderError::InvalidSignature(
            crate::crypto::SignatureError::InvalidPublicKey,
        ))?;
    verify(
        &account.public_key,
        &config.signing_domain,
        &signing_message(tx),
        &base.signature,
    )
    .map_err(CommanderError::InvalidSignature)
}

fn validate_target<S: KvRead>(store: &S, tx: &Transaction, sender: &UserState) -> CommanderResult<()> {
    match tx {
        Transaction::Transfer(t) => {
            if t.to_state_id == t.base.from_state_id {
                return Err(CommanderError::TransferToSelf);
            }
            if StateTree::new(store).try_leaf(t.to_state_id)?.is_none() {
                return Err(CommanderError::NonexistentReceiver(t.to_state_id));
            }
        }
        Transaction::Create2Transfer(t) => {
            let states = StateTree::new(store);
            for pub_key_id in AccountTree::new(store).ids_for_key(&t.to_public_key)? {
                if let Some((state_id, _)) = states.find_by_token(pub_key_id, &sender.token_id)? {
                    return Err(CommanderError::DestinationStateExists { state_id });
                }
            }
        }
        Transaction::MassMigration(t) => {
            let max_nonce = U256::from(u32::MAX);
            if t.base.nonce > max_nonce {
                return Err(CommanderError::NonceTooHigh {
                    expected: max_nonce,
                    got: t.base.nonce,
                });
            }
            if !spoke_exists(store, t.spoke_id)? {
                return Err(CommanderError::SpokeDoesNotExist(t.spoke_id));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
