//! State transitions for included transactions.
//!
//! Admission checks ran against the state at submission time. By the time
//! the builder gets to a transaction the state may have moved (other
//! commitments, a revert), so every rule that protects the ledger is checked
//! again here. A violation is reported as a transaction-level failure and
//! the builder drops that transaction; storage errors stay fatal.

use primitive_types::U256;

use crate::error::{CommanderError, CommanderResult};
use crate::storage::account_tree::AccountTree;
use crate::storage::db::KvWrite;
use crate::storage::spoke_exists;
use crate::storage::state_tree::{StateTree, UserState};
use crate::transaction::{Create2Transfer, MassMigration, Transaction, Transfer};

/// Whether `err` condemns only the transaction being applied.
pub fn is_transaction_failure(err: &CommanderError) -> bool {
    matches!(
        err,
        CommanderError::NonexistentSender(_)
            | CommanderError::NonexistentReceiver(_)
            | CommanderError::TransferToSelf
            | CommanderError::TokenMismatch
            | CommanderError::InsufficientBalance { .. }
            | CommanderError::BalanceOverflow
            | CommanderError::NonceTooLow { .. }
            | CommanderError::NonceTooHigh { .. }
            | CommanderError::SpokeDoesNotExist(_)
            | CommanderError::NoVacantSubtree
    )
}

/// Apply `tx` to the trees, returning the transaction as included (a
/// create-and-transfer gains its destination IDs). Fees are not credited
/// here; see [`credit_fees`].
pub fn apply_transaction<S: KvWrite>(store: &mut S, tx: &Transaction) -> CommanderResult<Transaction> {
    match tx {
        Transaction::Transfer(t) => {
            apply_transfer(store, t)?;
            Ok(tx.clone())
        }
        Transaction::Create2Transfer(t) => apply_create2transfer(store, t).map(Transaction::from),
        Transaction::MassMigration(t) => {
            apply_mass_migration(store, t)?;
            Ok(tx.clone())
        }
    }
}

/// Debit `amount + fee` from the sender and bump its nonce.
fn debit_sender<S: KvWrite>(store: &mut S, tx: &Transaction) -> CommanderResult<UserState> {
    let base = tx.base();
    let mut states = StateTree::new(&mut *store);
    let mut sender = states
        .try_leaf(base.from_state_id)?
        .ok_or(CommanderError::NonexistentSender(base.from_state_id))?;

    if base.nonce != sender.nonce {
        let (expected, got) = (sender.nonce, base.nonce);
        return Err(if got < expected {
            CommanderError::NonceTooLow { expected, got }
        } else {
            CommanderError::NonceTooHigh { expected, got }
        });
    }
    let cost = tx.total_cost()?;
    if sender.balance < cost {
        return Err(CommanderError::InsufficientBalance {
            required: cost,
            available: sender.balance,
        });
    }

    sender.balance = sender.balance - cost;
    sender.nonce = sender.nonce + U256::one();
    states.set(base.from_state_id, &sender)?;
    Ok(sender)
}

fn apply_transfer<S: KvWrite>(store: &mut S, tx: &Transfer) -> CommanderResult<()> {
    if tx.to_state_id == tx.base.from_state_id {
        return Err(CommanderError::TransferToSelf);
    }
    let mut states = StateTree::new(&mut *store);
    let receiver = states
        .try_leaf(tx.to_state_id)?
        .ok_or(CommanderError::NonexistentReceiver(tx.to_state_id))?;
    let sender = states
        .try_leaf(tx.base.from_state_id)?
        .ok_or(CommanderError::NonexistentSender(tx.base.from_state_id))?;
    if sender.token_id != receiver.token_id {
        return Err(CommanderError::TokenMismatch);
    }
    let credited = receiver
        .balance
        .checked_add(tx.base.amount)
        .ok_or(CommanderError::BalanceOverflow)?;

    debit_sender(store, &Transaction::Transfer(tx.clone()))?;
    StateTree::new(&mut *store).set(
        tx.to_state_id,
        &UserState {
            balance: credited,
            ..receiver
        },
    )?;
    Ok(())
}

fn apply_create2transfer<S: KvWrite>(
    store: &mut S,
    tx: &Create2Transfer,
) -> CommanderResult<Create2Transfer> {
    let sender = debit_sender(store, &Transaction::Create2Transfer(tx.clone()))?;

    let mut accounts = AccountTree::new(&mut *store);
    let to_pub_key_id = match accounts.ids_for_key(&tx.to_public_key)?.first() {
        Some(id) => *id,
        None => accounts.register_next(tx.to_public_key)?,
    };
    let (to_state_id, _) = StateTree::new(&mut *store).create(&UserState {
        pub_key_id: to_pub_key_id,
        token_id: sender.token_id,
        balance: tx.base.amount,
        nonce: U256::zero(),
    })?;

    Ok(Create2Transfer {
        to_state_id: Some(to_state_id),
        to_pub_key_id: Some(to_pub_key_id),
        ..tx.clone()
    })
}

fn apply_mass_migration<S: KvWrite>(store: &mut S, tx: &MassMigration) -> CommanderResult<()> {
    if !spoke_exists(store, tx.spoke_id)? {
        return Err(CommanderError::SpokeDoesNotExist(tx.spoke_id));
    }
    debit_sender(store, &Transaction::MassMigration(tx.clone()))?;
    Ok(())
}

/// Credit the summed fees of a commitment to its fee receiver.
pub fn credit_fees<S: KvWrite>(
    store: &mut S,
    fee_receiver_state_id: u32,
    fees: U256,
) -> CommanderResult<()> {
    if fees.is_zero() {
        return Ok(());
    }
    let mut states = StateTree::new(store);
    let mut receiver = states.leaf(fee_receiver_state_id)?;
    receiver.balance = receiver
        .balance
        .checked_add(fees)
        .ok_or(CommanderError::BalanceOverflow)?;
    states.set(fee_receiver_state_id, &receiver)?;
    Ok(())
}
