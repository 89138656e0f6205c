//! # Batch Builder
//!
//! Turns queued transactions into one single-type batch per call.
//!
//! ## Pipeline
//!
//! ```text
//! SELECT   → k-way merge of per-sender queues by arrival number
//! EXECUTE  → apply each pick to the trees, dropping transactions that
//!            no longer pass, until the commitment is full
//! BUILD    → credit fees, aggregate signatures, withdraw tree, calldata
//! ASSEMBLE → body hashes against the final account root, batch hash
//! ```
//!
//! Everything happens inside the caller's [`WriteTxn`]. A commitment that
//! ends up below the minimum size is undone with a checkpoint; a batch
//! below the minimum commitment count is undone entirely. Transactions
//! dropped along the way stay dropped either way.
//!
//! Selection only depends on the mempool contents and the trees, so two
//! builders fed the same queue produce the same batch. That is what makes
//! a rebuild after a revert reproduce the reverted roots.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use primitive_types::{H256, U256};
use tracing::{debug, info, warn};

use super::apply::{apply_transaction, credit_fees, is_transaction_failure};
use super::proofs::{withdraw_leaves, withdraw_tree};
use super::types::{Batch, BatchStatus, Commitment, CommitmentId, FailedTx, MassMigrationMeta, TxReceipt};
use crate::config::RollupConfig;
use crate::crypto::keys::SIGNATURE_LENGTH;
use crate::crypto::{aggregate, Signature};
use crate::error::{CommanderError, CommanderResult};
use crate::mempool::{Mempool, PendingTx};
use crate::merkle::CommitmentMerkleTree;
use crate::storage::account_tree::AccountTree;
use crate::storage::batches::BatchStore;
use crate::storage::db::{KvWrite, WriteTxn};
use crate::storage::state_tree::StateTree;
use crate::transaction::encoding::serialize_for_commitment;
use crate::transaction::{Transaction, TxType};

/// Result of one build attempt.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub batch: Option<Batch>,
    /// Transactions dropped from the mempool while applying.
    pub failed: Vec<FailedTx>,
}

/// Size floors for one attempt, relaxed once a queued transaction is old.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Limits {
    min_txs: usize,
    min_commitments: usize,
}

/// What the commitment being built has committed to so far.
#[derive(Debug, Default)]
struct Slot {
    token_id: Option<U256>,
    spoke_id: Option<u32>,
    fee_receiver: Option<u32>,
    /// Tokens without a fee receiver leaf, skipped for this commitment.
    unpaid_tokens: BTreeSet<U256>,
}

enum Pick {
    Include(Transaction),
    /// Leave the sender's queue alone for the rest of this commitment.
    Freeze,
    Drop(CommanderError),
}

pub struct BatchBuilder<'a> {
    config: &'a RollupConfig,
}

impl<'a> BatchBuilder<'a> {
    pub fn new(config: &'a RollupConfig) -> Self {
        Self { config }
    }

    /// Build and store at most one batch of `batch_type`.
    ///
    /// Writes go to `txn`; the caller commits. On `batch: None` the only
    /// staged writes are dropped transactions.
    pub fn build_batch(
        &self,
        txn: &mut WriteTxn<'_>,
        batch_type: TxType,
        now: DateTime<Utc>,
    ) -> CommanderResult<BuildOutcome> {
        let Some(limits) = self.limits(txn, batch_type, now)? else {
            return Ok(BuildOutcome::default());
        };

        let batch_id = BatchStore::new(&*txn).next_batch_id()?;
        let prev_state_root = StateTree::new(&*txn).root()?;
        let start = txn.checkpoint();
        let mut failed = Vec::new();
        let mut commitments = Vec::new();

        while commitments.len() < self.config.max_commitments_per_batch {
            let id = CommitmentId {
                batch_id,
                index: commitments.len() as u32,
            };
            let checkpoint = txn.checkpoint();
            match self.build_commitment(txn, batch_type, id, limits, &mut failed)? {
                Some(commitment) => commitments.push(commitment),
                None => {
                    txn.restore(checkpoint);
                    replay_failures(txn, &failed)?;
                    break;
                }
            }
        }

        if commitments.len() < limits.min_commitments {
            txn.restore(start);
            replay_failures(txn, &failed)?;
            debug!(
                batch_type = %batch_type,
                have = commitments.len(),
                need = limits.min_commitments,
                "not enough commitments for a batch"
            );
            return Ok(BuildOutcome { batch: None, failed });
        }

        let account_tree_root = AccountTree::new(&*txn).root()?;
        for commitment in &mut commitments {
            commitment.body_hash = commitment.compute_body_hash(&account_tree_root);
        }
        let leaves: Vec<H256> = commitments.iter().map(Commitment::leaf_hash).collect();

        let batch = Batch {
            id: batch_id,
            batch_type,
            status: BatchStatus::Pending,
            transaction_hash: None,
            hash: CommitmentMerkleTree::new(&leaves).root(),
            finalisation_block: None,
            account_tree_root,
            prev_state_root,
            submission_time: None,
            commitments,
        };
        BatchStore::new(&mut *txn).put(&batch)?;

        info!(
            batch_id,
            batch_type = %batch_type,
            commitments = batch.commitments.len(),
            txs = batch.transaction_count(),
            failed = failed.len(),
            post_state_root = ?batch.post_state_root(),
            "batch created"
        );
        Ok(BuildOutcome {
            batch: Some(batch),
            failed,
        })
    }

    /// `None` when nothing of `batch_type` is queued.
    fn limits(
        &self,
        txn: &WriteTxn<'_>,
        batch_type: TxType,
        now: DateTime<Utc>,
    ) -> CommanderResult<Option<Limits>> {
        let queues = Mempool::new(txn).by_sender()?;
        let oldest = queues
            .values()
            .flatten()
            .filter(|entry| entry.tx.tx_type() == batch_type)
            .map(|entry| entry.tx.base().received_at)
            .min();
        let Some(oldest) = oldest else {
            return Ok(None);
        };

        let aged = (now - oldest)
            .to_std()
            .is_ok_and(|age| age >= self.config.max_txn_delay());
        if aged {
            debug!(batch_type = %batch_type, %oldest, "queued transaction past max delay");
            return Ok(Some(Limits {
                min_txs: 1,
                min_commitments: 1,
            }));
        }
        Ok(Some(Limits {
            min_txs: self.config.min_txs_per_commitment,
            min_commitments: self.config.min_commitments_per_batch,
        }))
    }

    // -----------------------------------------------------------------------
    // Commitments
    // -----------------------------------------------------------------------

    /// Fill one commitment. `None` when fewer than `limits.min_txs` could be
    /// applied; the caller restores its checkpoint.
    fn build_commitment(
        &self,
        txn: &mut WriteTxn<'_>,
        batch_type: TxType,
        id: CommitmentId,
        limits: Limits,
        failed: &mut Vec<FailedTx>,
    ) -> CommanderResult<Option<Commitment>> {
        let first_update = StateTree::new(&*txn).update_count()?;
        let mut queues: Vec<VecDeque<PendingTx>> = Mempool::new(&*txn)
            .by_sender()?
            .into_values()
            .map(VecDeque::from)
            .collect();
        let mut frozen = vec![false; queues.len()];
        let mut slot = Slot::default();
        let mut included: Vec<(PendingTx, Transaction)> = Vec::new();

        while included.len() < self.config.max_txs_per_commitment {
            let next = queues
                .iter()
                .enumerate()
                .filter(|(i, _)| !frozen[*i])
                .filter_map(|(i, queue)| queue.front().map(|head| (head.seq, i)))
                .min();
            let Some((_, i)) = next else {
                break;
            };
            let Some(entry) = queues[i].pop_front() else {
                break;
            };

            match self.pick(txn, &entry.tx, batch_type, &mut slot)? {
                Pick::Include(applied) => included.push((entry, applied)),
                Pick::Freeze => {
                    queues[i].push_front(entry);
                    frozen[i] = true;
                }
                Pick::Drop(err) => {
                    debug!(hash = ?entry.tx.hash(), error = %err, "dropping transaction");
                    let failure = FailedTx {
                        tx: entry.tx,
                        error: err.to_string(),
                    };
                    record_failure(txn, &failure)?;
                    failed.push(failure);
                }
            }
        }

        if included.len() < limits.min_txs {
            debug!(
                commitment = %id,
                have = included.len(),
                need = limits.min_txs,
                "not enough transactions for a commitment"
            );
            return Ok(None);
        }
        let (Some(token_id), Some(fee_receiver)) = (slot.token_id, slot.fee_receiver) else {
            return Err(CommanderError::Internal(format!(
                "commitment {id} has transactions but no token"
            )));
        };

        let mut fees = U256::zero();
        for (_, tx) in &included {
            fees = fees
                .checked_add(tx.base().fee)
                .ok_or(CommanderError::BalanceOverflow)?;
        }
        credit_fees(txn, fee_receiver, fees)?;

        for (entry, tx) in &included {
            Mempool::new(&mut *txn).remove(tx.from_state_id(), &tx.nonce())?;
            BatchStore::new(&mut *txn).put_receipt(
                &tx.hash(),
                &TxReceipt {
                    commitment_id: id,
                    arrival_seq: entry.seq,
                },
            )?;
        }
        // Senders, receivers, new C2T states and the fee receiver.
        let touched = StateTree::new(&*txn).touched_since(first_update)?;
        let mut mempool = Mempool::new(&mut *txn);
        for state_id in touched {
            mempool.refresh_pending_state(state_id)?;
        }

        let transactions: Vec<Transaction> = included.into_iter().map(|(_, tx)| tx).collect();
        let mass_migration = match slot.spoke_id {
            Some(spoke_id) => {
                let leaves = withdraw_leaves(&*txn, &transactions, token_id)?;
                let mut total_amount = U256::zero();
                for tx in &transactions {
                    total_amount = total_amount
                        .checked_add(tx.base().amount)
                        .ok_or(CommanderError::BalanceOverflow)?;
                }
                Some(MassMigrationMeta {
                    spoke_id,
                    token_id,
                    total_amount,
                    withdraw_root: withdraw_tree(&leaves).root(),
                })
            }
            None => None,
        };

        let commitment = Commitment {
            id,
            commitment_type: batch_type,
            post_state_root: StateTree::new(&*txn).root()?,
            fee_receiver_state_id: fee_receiver,
            combined_signature: self.combined_signature(&transactions)?,
            body_hash: H256::zero(),
            calldata: serialize_for_commitment(&transactions)?,
            transactions,
            mass_migration,
        };
        debug!(
            commitment = %commitment.id,
            txs = commitment.transactions.len(),
            %fees,
            "commitment built"
        );
        Ok(Some(commitment))
    }

    /// Decide what to do with the head of one sender's queue, applying it
    /// when it fits the commitment.
    fn pick(
        &self,
        txn: &mut WriteTxn<'_>,
        tx: &Transaction,
        batch_type: TxType,
        slot: &mut Slot,
    ) -> CommanderResult<Pick> {
        if tx.tx_type() != batch_type {
            return Ok(Pick::Freeze);
        }
        let from = tx.from_state_id();
        let Some(sender) = StateTree::new(&*txn).try_leaf(from)? else {
            return Ok(Pick::Drop(CommanderError::NonexistentSender(from)));
        };
        // A gap in front of this nonce may still be filled.
        if tx.nonce() > sender.nonce {
            return Ok(Pick::Freeze);
        }
        if slot.token_id.is_some_and(|token| token != sender.token_id) {
            return Ok(Pick::Freeze);
        }
        let spoke_id = match tx {
            Transaction::MassMigration(mm) => {
                if slot.spoke_id.is_some_and(|spoke| spoke != mm.spoke_id) {
                    return Ok(Pick::Freeze);
                }
                Some(mm.spoke_id)
            }
            _ => None,
        };
        if slot.unpaid_tokens.contains(&sender.token_id) {
            return Ok(Pick::Freeze);
        }
        let fee_receiver = match slot.fee_receiver {
            Some(id) => id,
            None => {
                let found = StateTree::new(&*txn)
                    .find_by_token(self.config.fee_receiver_pub_key_id, &sender.token_id)?;
                match found {
                    Some((state_id, _)) => state_id,
                    None => {
                        warn!(
                            token_id = %sender.token_id,
                            pub_key_id = self.config.fee_receiver_pub_key_id,
                            "no fee receiver for token, leaving its transactions queued"
                        );
                        slot.unpaid_tokens.insert(sender.token_id);
                        return Ok(Pick::Freeze);
                    }
                }
            }
        };

        match apply_transaction(txn, tx) {
            Ok(applied) => {
                slot.token_id = Some(sender.token_id);
                slot.fee_receiver = Some(fee_receiver);
                if spoke_id.is_some() {
                    slot.spoke_id = spoke_id;
                }
                Ok(Pick::Include(applied))
            }
            Err(err) if is_transaction_failure(&err) => Ok(Pick::Drop(err)),
            Err(err) => Err(err),
        }
    }

    fn combined_signature(&self, txs: &[Transaction]) -> CommanderResult<Signature> {
        let signatures: Vec<Signature> = txs.iter().map(|tx| tx.base().signature).collect();
        match aggregate(&signatures) {
            Ok(signature) => Ok(signature),
            Err(err) if self.config.disable_signatures => {
                debug!(error = %err, "signatures disabled, using an empty aggregate");
                Ok(Signature([0; SIGNATURE_LENGTH]))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Remove a failed transaction from the mempool and keep its error.
fn record_failure<S: KvWrite>(store: &mut S, failure: &FailedTx) -> CommanderResult<()> {
    let from = failure.tx.from_state_id();
    let mut mempool = Mempool::new(&mut *store);
    mempool.remove(from, &failure.tx.nonce())?;
    mempool.refresh_pending_state(from)?;
    BatchStore::new(store).put_failed(failure)
}

/// Re-apply failure records after a checkpoint restore undid them.
fn replay_failures<S: KvWrite>(store: &mut S, failed: &[FailedTx]) -> CommanderResult<()> {
    for failure in failed {
        record_failure(store, failure)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::BlsKeypair;
    use crate::storage::account_tree::AccountLeaf;
    use crate::storage::db::CommanderDb;
    use crate::storage::register_spoke;
    use crate::storage::state_tree::UserState;
    use crate::mempool::PendingState;
    use crate::transaction::{validate, TransactionBuilder, ValidationConfig};

    const FEE_RECEIVER: u32 = 0;

    fn config() -> RollupConfig {
        RollupConfig {
            disable_signatures: true,
            fee_receiver_pub_key_id: FEE_RECEIVER,
            ..RollupConfig::default()
        }
    }

    /// State 0 collects fees, states 1..=n hold 420 of token 0.
    fn setup(senders: u32) -> CommanderDb {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        for id in 0..=senders {
            let key = BlsKeypair::from_seed(&[id as u8 + 1; 32]).unwrap().public_key();
            AccountTree::new(&mut txn)
                .set_single(&AccountLeaf {
                    pub_key_id: id,
                    public_key: key,
                })
                .unwrap();
            StateTree::new(&mut txn)
                .set(
                    id,
                    &UserState {
                        pub_key_id: id,
                        token_id: U256::zero(),
                        balance: if id == FEE_RECEIVER { 0 } else { 420 }.into(),
                        nonce: U256::zero(),
                    },
                )
                .unwrap();
        }
        register_spoke(&mut txn, 1).unwrap();
        txn.commit().unwrap();
        db
    }

    fn queue(db: &CommanderDb, txs: Vec<Transaction>) {
        let mut txn = db.begin();
        let mut mempool = Mempool::new(&mut txn);
        for tx in txs {
            mempool.insert(tx).unwrap();
        }
        txn.commit().unwrap();
    }

    fn build(db: &CommanderDb, config: &RollupConfig, batch_type: TxType) -> BuildOutcome {
        let mut txn = db.begin();
        let outcome = BatchBuilder::new(config)
            .build_batch(&mut txn, batch_type, Utc::now())
            .unwrap();
        txn.commit().unwrap();
        outcome
    }

    fn leaf(db: &CommanderDb, id: u32) -> UserState {
        StateTree::new(db.read()).leaf(id).unwrap()
    }

    #[test]
    fn build_refreshes_pending_state_of_credited_accounts() {
        let db = setup(2);
        let config = RollupConfig {
            max_txs_per_commitment: 1,
            max_commitments_per_batch: 1,
            ..config()
        };
        queue(
            &db,
            vec![
                TransactionBuilder::transfer(1, 2).amount(100).fee(10).build(),
                TransactionBuilder::transfer(2, 1).amount(400).build(),
                TransactionBuilder::transfer(FEE_RECEIVER, 1).amount(5).build(),
            ],
        );

        let batch = build(&db, &config, TxType::Transfer).batch.unwrap();
        assert_eq!(batch.transaction_count(), 1);
        assert_eq!(leaf(&db, 2).balance, U256::from(520));
        assert_eq!(leaf(&db, FEE_RECEIVER).balance, U256::from(10));

        let view = db.read();
        let mempool = Mempool::new(&view);
        assert_eq!(
            mempool.pending_state(2).unwrap(),
            PendingState {
                nonce: U256::one(),
                balance: 120.into(),
            }
        );
        assert_eq!(
            mempool.pending_state(FEE_RECEIVER).unwrap(),
            PendingState {
                nonce: U256::one(),
                balance: 5.into(),
            }
        );
        for id in [FEE_RECEIVER, 1, 2] {
            assert_eq!(mempool.pending_state(id).unwrap(), mempool.project(id).unwrap());
        }

        // The credit is spendable right away.
        let next = TransactionBuilder::transfer(2, 1).amount(100).nonce(1).build();
        let validation = ValidationConfig {
            disable_signatures: true,
            ..ValidationConfig::default()
        };
        validate(&view, &next, &validation).unwrap();
    }

    #[test]
    fn transfer_batch_moves_funds_and_fees() {
        let db = setup(2);
        let tx = TransactionBuilder::transfer(1, 2).amount(50).fee(10).build();
        queue(&db, vec![tx.clone()]);

        let batch = build(&db, &config(), TxType::Transfer).batch.unwrap();
        assert_eq!(batch.id, 1);
        assert_eq!(batch.commitments.len(), 1);
        assert_eq!(batch.commitments[0].fee_receiver_state_id, 0);

        assert_eq!(leaf(&db, 1).balance, U256::from(360));
        assert_eq!(leaf(&db, 1).nonce, U256::one());
        assert_eq!(leaf(&db, 2).balance, U256::from(50));
        assert_eq!(leaf(&db, 0).balance, U256::from(10));

        let view = db.read();
        assert!(Mempool::new(&view).is_empty().unwrap());
        let receipt = BatchStore::new(&view).receipt(&tx.hash()).unwrap().unwrap();
        assert_eq!(receipt.commitment_id, CommitmentId { batch_id: 1, index: 0 });
        assert_eq!(BatchStore::new(&view).next_batch_id().unwrap(), 2);
    }

    #[test]
    fn batch_hash_and_body_hash_are_consistent() {
        let db = setup(2);
        queue(&db, vec![TransactionBuilder::transfer(1, 2).amount(50).fee(10).build()]);
        let batch = build(&db, &config(), TxType::Transfer).batch.unwrap();

        let commitment = &batch.commitments[0];
        assert_eq!(
            commitment.body_hash,
            commitment.compute_body_hash(&batch.account_tree_root)
        );
        assert_eq!(batch.hash, CommitmentMerkleTree::new(&[commitment.leaf_hash()]).root());
        assert_eq!(batch.post_state_root(), StateTree::new(db.read()).root().unwrap());
    }

    #[test]
    fn waits_for_minimum_until_delay_passes() {
        let db = setup(2);
        let config = RollupConfig {
            min_txs_per_commitment: 2,
            ..config()
        };
        queue(&db, vec![TransactionBuilder::transfer(1, 2).amount(5).build()]);
        let root = StateTree::new(db.read()).root().unwrap();

        assert!(build(&db, &config, TxType::Transfer).batch.is_none());
        assert_eq!(StateTree::new(db.read()).root().unwrap(), root);
        assert_eq!(Mempool::new(db.read()).len().unwrap(), 1);

        let mut txn = db.begin();
        let later = Utc::now() + chrono::Duration::milliseconds(config.max_txn_delay_ms as i64 + 1);
        let outcome = BatchBuilder::new(&config)
            .build_batch(&mut txn, TxType::Transfer, later)
            .unwrap();
        assert_eq!(outcome.batch.unwrap().transaction_count(), 1);
    }

    #[test]
    fn full_commitments_split_and_respect_nonce_order() {
        let db = setup(2);
        let config = RollupConfig {
            max_txs_per_commitment: 2,
            ..config()
        };
        queue(
            &db,
            (0..3)
                .map(|n| TransactionBuilder::transfer(1, 2).amount(1).nonce(n).build())
                .collect(),
        );
        let batch = build(&db, &config, TxType::Transfer).batch.unwrap();
        assert_eq!(batch.commitments.len(), 2);
        let nonces: Vec<U256> = batch
            .commitments
            .iter()
            .flat_map(|c| c.transactions.iter().map(Transaction::nonce))
            .collect();
        assert_eq!(nonces, vec![0.into(), 1.into(), 2.into()]);
    }

    #[test]
    fn gap_leaves_later_nonces_queued() {
        let db = setup(2);
        queue(
            &db,
            vec![
                TransactionBuilder::transfer(1, 2).amount(1).nonce(0).build(),
                TransactionBuilder::transfer(1, 2).amount(1).nonce(2).build(),
            ],
        );
        let batch = build(&db, &config(), TxType::Transfer).batch.unwrap();
        assert_eq!(batch.transaction_count(), 1);
        assert_eq!(Mempool::new(db.read()).len().unwrap(), 1);
    }

    #[test]
    fn failing_transactions_are_dropped_and_recorded() {
        let db = setup(2);
        queue(
            &db,
            vec![
                TransactionBuilder::transfer(1, 2).amount(400).fee(10).build(),
                TransactionBuilder::transfer(2, 1).amount(5).build(),
            ],
        );
        // Drain sender 1 behind the mempool's back.
        let mut txn = db.begin();
        let mut sender = StateTree::new(&txn).leaf(1).unwrap();
        sender.balance = 100.into();
        StateTree::new(&mut txn).set(1, &sender).unwrap();
        txn.commit().unwrap();

        let outcome = build(&db, &config(), TxType::Transfer);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.batch.unwrap().transaction_count(), 1);

        let view = db.read();
        assert!(Mempool::new(&view).is_empty().unwrap());
        let failed = BatchStore::new(&view).failed(&outcome.failed[0].tx.hash()).unwrap();
        assert!(failed.unwrap().error.contains("balance"));
    }

    #[test]
    fn failures_survive_an_abandoned_batch() {
        let db = setup(2);
        let config = RollupConfig {
            min_commitments_per_batch: 2,
            ..config()
        };
        queue(
            &db,
            vec![
                TransactionBuilder::transfer(1, 9).amount(5).build(),
                TransactionBuilder::transfer(2, 1).amount(5).build(),
            ],
        );
        let outcome = build(&db, &config, TxType::Transfer);
        assert!(outcome.batch.is_none());
        assert_eq!(outcome.failed.len(), 1);

        let view = db.read();
        assert_eq!(Mempool::new(&view).len().unwrap(), 1);
        assert_eq!(StateTree::new(&view).leaf(2).unwrap().nonce, U256::zero());
        assert_eq!(BatchStore::new(&view).next_batch_id().unwrap(), 1);
    }

    #[test]
    fn only_the_requested_type_is_built() {
        let db = setup(2);
        queue(&db, vec![TransactionBuilder::mass_migration(1, 1).amount(5).build()]);
        assert!(build(&db, &config(), TxType::Transfer).batch.is_none());
        let batch = build(&db, &config(), TxType::MassMigration).batch.unwrap();
        assert_eq!(batch.batch_type, TxType::MassMigration);
    }

    #[test]
    fn mass_migration_builds_withdraw_tree() {
        let db = setup(2);
        queue(
            &db,
            vec![
                TransactionBuilder::mass_migration(1, 1).amount(90).fee(10).build(),
                TransactionBuilder::mass_migration(1, 1).amount(90).fee(10).nonce(1).build(),
            ],
        );
        let batch = build(&db, &config(), TxType::MassMigration).batch.unwrap();
        let meta = batch.commitments[0].mass_migration.clone().unwrap();
        assert_eq!(meta.total_amount, U256::from(180));
        assert_eq!(meta.spoke_id, 1);

        let leaves = withdraw_leaves(&db.read(), &batch.commitments[0].transactions, U256::zero()).unwrap();
        assert_eq!(leaves.len(), 2);
        assert_eq!(withdraw_tree(&leaves).root(), meta.withdraw_root);
        assert_eq!(leaf(&db, 1).balance, U256::from(220));
    }

    #[test]
    fn create2transfer_fills_destination_ids() {
        let db = setup(1);
        let key = BlsKeypair::from_seed(&[42; 32]).unwrap().public_key();
        queue(&db, vec![TransactionBuilder::create2transfer(1, key).amount(50).fee(10).build()]);

        let batch = build(&db, &config(), TxType::Create2Transfer).batch.unwrap();
        let Transaction::Create2Transfer(tx) = &batch.commitments[0].transactions[0] else {
            panic!("wrong variant");
        };
        assert_eq!(tx.to_state_id, Some(2));
        assert_eq!(tx.to_pub_key_id, Some(2));
        assert_eq!(batch.account_tree_root, AccountTree::new(db.read()).root().unwrap());
        assert_eq!(batch.commitments[0].calldata.len(), 16);
    }

    #[test]
    fn missing_fee_receiver_leaves_token_queued() {
        let db = setup(2);
        let mut txn = db.begin();
        let mut other = StateTree::new(&txn).leaf(2).unwrap();
        other.token_id = 7.into();
        StateTree::new(&mut txn).set(2, &other).unwrap();
        txn.commit().unwrap();

        queue(
            &db,
            vec![
                TransactionBuilder::transfer(2, 1).amount(1).build(),
                TransactionBuilder::transfer(1, 0).amount(1).build(),
            ],
        );
        let batch = build(&db, &config(), TxType::Transfer).batch;
        // Token 7 has no receiver; token 0 still goes through.
        assert_eq!(batch.unwrap().transaction_count(), 1);
        assert_eq!(Mempool::new(db.read()).len().unwrap(), 1);
    }

    #[test]
    fn identical_queues_build_identical_batches() {
        let txs = vec![
            TransactionBuilder::transfer(1, 2).amount(50).fee(10).build(),
            TransactionBuilder::transfer(2, 1).amount(20).fee(1).build(),
            TransactionBuilder::transfer(1, 2).amount(30).fee(1).nonce(1).build(),
        ];
        let (a, b) = (setup(2), setup(2));
        queue(&a, txs.clone());
        queue(&b, txs);
        let left = build(&a, &config(), TxType::Transfer).batch.unwrap();
        let right = build(&b, &config(), TxType::Transfer).batch.unwrap();
        assert_eq!(left.hash, right.hash);
        assert_eq!(left.post_state_root(), right.post_state_root());
    }
}
