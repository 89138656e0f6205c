//! # Commander
//!
//! The single entry point transports talk to. Wraps the database and the
//! configuration, runs every mutation inside one scoped write transaction,
//! and holds the batch gate that keeps a revert from interleaving with a
//! build cycle.
//!
//! ## Locking
//!
//! - Writes serialize on the storage writer lock ([`CommanderDb::begin`]).
//! - Reads take a [`ReadView`](crate::storage::ReadView) and see either the
//!   state before or after any commit, never a partial one.
//! - The batch gate is held for a whole build cycle (every batch type) and
//!   for a whole revert, so a revert never lands between two batches of
//!   one cycle, or between building a batch and recording its submission.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use primitive_types::{H256, U256};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::batch::builder::BatchBuilder;
use crate::batch::proofs::{commitment_proof, withdraw_proof, CommitmentProof, WithdrawProof};
use crate::batch::revert::{revert_batches, RevertOutcome};
use crate::batch::{Batch, BatchStatus, Commitment, CommitmentId};
use crate::config::{CommanderConfig, GenesisAccount};
use crate::crypto::PublicKey;
use crate::error::{CommanderError, CommanderResult, NotFound};
use crate::mempool::{Admission, Mempool, PendingRecompute, PendingState};
use crate::storage::{self, AccountTree, BatchStore, CommanderDb, StateTree, UserState};
use crate::transaction::{validate, Transaction, TransactionRequest, TxType};

// ---------------------------------------------------------------------------
// Read models
// ---------------------------------------------------------------------------

/// Where a transaction is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Pending,
    InBatch,
    Mined,
    Finalised,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction: Transaction,
    pub status: TxStatus,
    #[serde(rename = "commitmentID", skip_serializing_if = "Option::is_none")]
    pub commitment_id: Option<CommitmentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Counters since process start, read by the node's metrics task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommanderStats {
    pub batches_created: u64,
    pub commitments_created: u64,
    pub txs_included: u64,
    pub txs_failed: u64,
    pub reverts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    batches_created: AtomicU64,
    commitments_created: AtomicU64,
    txs_included: AtomicU64,
    txs_failed: AtomicU64,
    reverts: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CommanderStats {
        CommanderStats {
            batches_created: self.batches_created.load(Ordering::Relaxed),
            commitments_created: self.commitments_created.load(Ordering::Relaxed),
            txs_included: self.txs_included.load(Ordering::Relaxed),
            txs_failed: self.txs_failed.load(Ordering::Relaxed),
            reverts: self.reverts.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Commander
// ---------------------------------------------------------------------------

struct Inner {
    db: CommanderDb,
    config: CommanderConfig,
    batch_gate: Mutex<()>,
    migration: AtomicBool,
    counters: Counters,
}

/// Cheap to clone; clones share one database and one batch gate.
#[derive(Clone)]
pub struct Commander {
    inner: Arc<Inner>,
}

impl Commander {
    /// Wrap `db`, loading the configured genesis accounts if the database
    /// has never been used.
    pub fn open(db: CommanderDb, config: CommanderConfig) -> CommanderResult<Self> {
        let migration = config.migration;
        let commander = Self {
            inner: Arc::new(Inner {
                db,
                config,
                batch_gate: Mutex::new(()),
                migration: AtomicBool::new(migration),
                counters: Counters::default(),
            }),
        };
        commander.load_genesis()?;
        Ok(commander)
    }

    pub fn db(&self) -> &CommanderDb {
        &self.inner.db
    }

    pub fn config(&self) -> &CommanderConfig {
        &self.inner.config
    }

    fn load_genesis(&self) -> CommanderResult<()> {
        let genesis = &self.inner.config.genesis;
        let mut txn = self.inner.db.begin();
        let fresh = StateTree::new(&txn).next_available_state_id()? == 0
            && AccountTree::new(&txn).next_pub_key_id()? == 0;
        if !fresh || genesis.is_empty() {
            return Ok(());
        }

        for GenesisAccount {
            public_key,
            token_id,
            balance,
        } in genesis
        {
            let mut accounts = AccountTree::new(&mut txn);
            let pub_key_id = match accounts.ids_for_key(public_key)?.first() {
                Some(id) => *id,
                None => accounts.register_next(*public_key)?,
            };
            let (state_id, _) = StateTree::new(&mut txn).create(&UserState {
                pub_key_id,
                token_id: *token_id,
                balance: *balance,
                nonce: U256::zero(),
            })?;
            debug!(state_id, pub_key_id, %balance, "genesis account created");
        }
        txn.commit()?;

        let root = StateTree::new(self.inner.db.read()).root()?;
        info!(accounts = genesis.len(), state_root = ?root, "genesis state loaded");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Validate and queue a transaction, returning its hash.
    ///
    /// Resubmitting a transaction that is still queued returns the same
    /// hash without queuing it twice.
    pub fn send_transaction(&self, request: TransactionRequest) -> CommanderResult<H256> {
        if self.is_migrating() {
            return Err(CommanderError::SendingDisabled);
        }
        let tx = request.into_transaction(Utc::now())?;
        let hash = tx.hash();

        let mut txn = self.inner.db.begin();
        if let Some(Admission::AlreadyQueued) = Mempool::new(&txn).check_duplicate(&tx)? {
            debug!(?hash, "transaction already queued");
            return Ok(hash);
        }
        validate(&txn, &tx, &self.inner.config.rollup.validation())?;
        Mempool::new(&mut txn).insert(tx)?;
        txn.commit()?;

        debug!(?hash, "transaction queued");
        Ok(hash)
    }

    pub fn get_transaction(&self, hash: &H256) -> CommanderResult<TransactionReceipt> {
        let view = self.inner.db.read();
        let batches = BatchStore::new(&view);

        if let Some(receipt) = batches.receipt(hash)? {
            let batch = batches.batch(receipt.commitment_id.batch_id)?;
            let transaction = batch
                .commitment(receipt.commitment_id.index)
                .and_then(|c| c.transactions.iter().find(|tx| tx.hash() == *hash))
                .cloned()
                .ok_or_else(|| {
                    CommanderError::Internal(format!("receipt of {hash:?} points at a missing transaction"))
                })?;
            let status = match batch.status {
                BatchStatus::Pending | BatchStatus::Submitted => TxStatus::InBatch,
                BatchStatus::Mined => TxStatus::Mined,
                BatchStatus::Finalised => TxStatus::Finalised,
            };
            return Ok(TransactionReceipt {
                transaction,
                status,
                commitment_id: Some(receipt.commitment_id),
                error_message: None,
            });
        }
        if let Some(entry) = Mempool::new(&view).by_hash(hash)? {
            return Ok(TransactionReceipt {
                transaction: entry.tx,
                status: TxStatus::Pending,
                commitment_id: None,
                error_message: None,
            });
        }
        if let Some(failed) = batches.failed(hash)? {
            return Ok(TransactionReceipt {
                transaction: failed.tx,
                status: TxStatus::Error,
                commitment_id: None,
                error_message: Some(failed.error),
            });
        }
        Err(NotFound::Transaction(*hash).into())
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    pub fn get_user_state(&self, state_id: u32) -> CommanderResult<UserState> {
        StateTree::new(self.inner.db.read()).leaf(state_id)
    }

    pub fn get_pending_state(&self, state_id: u32) -> CommanderResult<PendingState> {
        Mempool::new(self.inner.db.read()).pending_state(state_id)
    }

    pub fn mempool_size(&self) -> CommanderResult<usize> {
        Mempool::new(self.inner.db.read()).len()
    }

    pub fn register_spoke(&self, spoke_id: u32) -> CommanderResult<bool> {
        let mut txn = self.inner.db.begin();
        let added = storage::register_spoke(&mut txn, spoke_id)?;
        txn.commit()?;
        if added {
            info!(spoke_id, "spoke registered");
        }
        Ok(added)
    }

    // -----------------------------------------------------------------------
    // Batches and proofs
    // -----------------------------------------------------------------------

    pub fn get_batch(&self, batch_id: u64) -> CommanderResult<Batch> {
        BatchStore::new(self.inner.db.read()).batch(batch_id)
    }

    pub fn get_commitment(&self, id: CommitmentId) -> CommanderResult<Commitment> {
        BatchStore::new(self.inner.db.read()).commitment(id)
    }

    pub fn get_commitment_proof(&self, id: CommitmentId) -> CommanderResult<CommitmentProof> {
        let batch = self.get_batch(id.batch_id)?;
        commitment_proof(&batch, id)
    }

    pub fn get_withdraw_proof(
        &self,
        batch_id: u64,
        index: u32,
        tx_hash: &H256,
    ) -> CommanderResult<WithdrawProof> {
        let view = self.inner.db.read();
        let batch = BatchStore::new(&view).batch(batch_id)?;
        withdraw_proof(&view, &batch, CommitmentId { batch_id, index }, tx_hash)
    }

    /// Run one build cycle: at most one batch per type, in the fixed type
    /// order. Each batch is committed on its own.
    pub fn build_batches(&self, now: DateTime<Utc>) -> CommanderResult<Vec<Batch>> {
        if self.is_migrating() {
            return Ok(Vec::new());
        }
        let _gate = self.inner.batch_gate.lock();
        let builder = BatchBuilder::new(&self.inner.config.rollup);
        let counters = &self.inner.counters;

        let mut built = Vec::new();
        for batch_type in TxType::BUILD_ORDER {
            let mut txn = self.inner.db.begin();
            let outcome = builder.build_batch(&mut txn, batch_type, now)?;
            txn.commit()?;

            counters
                .txs_failed
                .fetch_add(outcome.failed.len() as u64, Ordering::Relaxed);
            if let Some(batch) = outcome.batch {
                counters.batches_created.fetch_add(1, Ordering::Relaxed);
                counters
                    .commitments_created
                    .fetch_add(batch.commitments.len() as u64, Ordering::Relaxed);
                counters
                    .txs_included
                    .fetch_add(batch.transaction_count() as u64, Ordering::Relaxed);
                built.push(batch);
            }
        }
        Ok(built)
    }

    /// Record the base-chain transaction carrying `batch_id`. Returns
    /// `None` if the batch was reverted in the meantime.
    pub fn mark_batch_submitted(
        &self,
        batch_id: u64,
        transaction_hash: H256,
    ) -> CommanderResult<Option<Batch>> {
        let _gate = self.inner.batch_gate.lock();
        let mut txn = self.inner.db.begin();
        if BatchStore::new(&txn).try_batch(batch_id)?.is_none() {
            warn!(batch_id, "submitted batch no longer exists");
            return Ok(None);
        }
        let batch = BatchStore::new(&mut txn).mark_submitted(batch_id, transaction_hash, Utc::now())?;
        txn.commit()?;
        info!(batch_id, tx_hash = ?transaction_hash, "batch submitted");
        Ok(Some(batch))
    }

    pub fn mark_batch_mined(&self, batch_id: u64, finalisation_block: u64) -> CommanderResult<Batch> {
        let mut txn = self.inner.db.begin();
        let batch = BatchStore::new(&mut txn).mark_mined(batch_id, finalisation_block)?;
        txn.commit()?;
        info!(batch_id, finalisation_block, "batch mined");
        Ok(batch)
    }

    /// Report the latest base-chain block. Finalises every mined batch
    /// whose finalisation block has been reached.
    pub fn set_latest_block(&self, block: u64) -> CommanderResult<Vec<u64>> {
        let mut txn = self.inner.db.begin();
        let finalised = BatchStore::new(&mut txn).finalise_up_to(block)?;
        txn.commit()?;
        if !finalised.is_empty() {
            info!(block, batches = ?finalised, "batches finalised");
        }
        Ok(finalised)
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    pub fn recompute_pending_state(
        &self,
        state_id: u32,
        mutate: bool,
    ) -> CommanderResult<PendingRecompute> {
        let mut txn = self.inner.db.begin();
        let result = Mempool::new(&mut txn).recompute_pending_state(state_id, mutate)?;
        if mutate {
            txn.commit()?;
        }
        Ok(result)
    }

    /// Remove one queued transaction, returning its hash.
    pub fn drop_transaction(&self, state_id: u32, nonce: U256) -> CommanderResult<H256> {
        let mut txn = self.inner.db.begin();
        let entry = Mempool::new(&mut txn).drop_transaction(state_id, &nonce)?;
        txn.commit()?;
        info!(state_id, %nonce, hash = ?entry.tx.hash(), "transaction dropped by admin");
        Ok(entry.tx.hash())
    }

    /// Roll back `batch_id` and every later batch. Excludes build cycles
    /// for its whole duration.
    pub fn revert_batches(&self, batch_id: u64) -> CommanderResult<RevertOutcome> {
        let _gate = self.inner.batch_gate.lock();
        let mut txn = self.inner.db.begin();
        let outcome = revert_batches(&mut txn, batch_id)?;
        txn.commit()?;
        self.inner.counters.reverts.fetch_add(1, Ordering::Relaxed);
        Ok(outcome)
    }

    /// Overwrite or clear an account leaf, bypassing write-once protection.
    /// Returns the replaced key and the new account root.
    pub fn reset_pubkey(
        &self,
        pub_key_id: u32,
        public_key: Option<PublicKey>,
    ) -> CommanderResult<(Option<PublicKey>, H256)> {
        let mut txn = self.inner.db.begin();
        let result = AccountTree::new(&mut txn).unsafe_reset(pub_key_id, public_key)?;
        txn.commit()?;
        Ok(result)
    }

    /// Pause batch creation and reject new transactions, or resume.
    pub fn set_migration(&self, enabled: bool) {
        let was = self.inner.migration.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!(enabled, "migration mode changed");
        }
    }

    pub fn is_migrating(&self) -> bool {
        self.inner.migration.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CommanderStats {
        self.inner.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RollupConfig;
    use crate::crypto::BlsKeypair;
    use crate::error::ErrorCode;
    use crate::transaction::TransactionBuilder;

    fn keys(n: u8) -> Vec<BlsKeypair> {
        (0..n).map(|i| BlsKeypair::from_seed(&[i + 1; 32]).unwrap()).collect()
    }

    fn commander() -> (Commander, Vec<BlsKeypair>) {
        let keys = keys(3);
        let genesis = keys
            .iter()
            .enumerate()
            .map(|(i, kp)| GenesisAccount {
                public_key: kp.public_key(),
                token_id: U256::zero(),
                balance: if i == 0 { 0 } else { 420 }.into(),
            })
            .collect();
        let config = CommanderConfig {
            rollup: RollupConfig::default(),
            genesis,
            ..CommanderConfig::default()
        };
        let commander = Commander::open(CommanderDb::open_temporary().unwrap(), config).unwrap();
        (commander, keys)
    }

    fn signed(commander: &Commander, keypair: &BlsKeypair, builder: TransactionBuilder) -> TransactionRequest {
        let tx = builder.sign(keypair, &commander.config().rollup.signing_domain);
        TransactionRequest::from(&tx)
    }

    #[test]
    fn genesis_is_loaded_once() {
        let (commander, _) = commander();
        assert_eq!(commander.get_user_state(1).unwrap().balance, U256::from(420));
        let root = StateTree::new(commander.db().read()).root().unwrap();

        commander.load_genesis().unwrap();
        assert_eq!(StateTree::new(commander.db().read()).root().unwrap(), root);
    }

    #[test]
    fn send_build_and_query() {
        let (commander, keys) = commander();
        let request = signed(&commander, &keys[1], TransactionBuilder::transfer(1, 2).amount(50).fee(10));
        let hash = commander.send_transaction(request.clone()).unwrap();
        assert_eq!(commander.get_pending_state(1).unwrap().nonce, U256::one());
        assert_eq!(commander.get_transaction(&hash).unwrap().status, TxStatus::Pending);

        // Same transaction again: same hash, nothing new queued.
        assert_eq!(commander.send_transaction(request).unwrap(), hash);
        assert_eq!(commander.mempool_size().unwrap(), 1);

        let batches = commander.build_batches(Utc::now()).unwrap();
        assert_eq!(batches.len(), 1);
        let receipt = commander.get_transaction(&hash).unwrap();
        assert_eq!(receipt.status, TxStatus::InBatch);
        assert_eq!(receipt.commitment_id, Some(CommitmentId { batch_id: 1, index: 0 }));

        assert_eq!(commander.get_user_state(0).unwrap().balance, U256::from(10));
        assert_eq!(commander.get_user_state(1).unwrap().balance, U256::from(360));
        assert_eq!(commander.get_user_state(2).unwrap().balance, U256::from(470));
        assert_eq!(commander.stats().txs_included, 1);
        assert!(commander.get_commitment_proof(receipt.commitment_id.unwrap()).is_ok());
    }

    #[test]
    fn different_transaction_for_queued_nonce_is_rejected() {
        let (commander, keys) = commander();
        let first = signed(&commander, &keys[1], TransactionBuilder::transfer(1, 2).amount(50));
        let second = signed(&commander, &keys[1], TransactionBuilder::transfer(1, 2).amount(60));
        commander.send_transaction(first).unwrap();
        let err = commander.send_transaction(second).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PendingTransaction);
    }

    #[test]
    fn migration_blocks_sending_and_building() {
        let (commander, keys) = commander();
        let request = signed(&commander, &keys[1], TransactionBuilder::transfer(1, 2).amount(5));
        commander.send_transaction(request).unwrap();

        commander.set_migration(true);
        let another = signed(&commander, &keys[2], TransactionBuilder::transfer(2, 1).amount(5));
        assert!(matches!(
            commander.send_transaction(another),
            Err(CommanderError::SendingDisabled)
        ));
        assert!(commander.build_batches(Utc::now()).unwrap().is_empty());

        commander.set_migration(false);
        assert_eq!(commander.build_batches(Utc::now()).unwrap().len(), 1);
    }

    #[test]
    fn batch_status_follows_chain_reports() {
        let (commander, keys) = commander();
        let request = signed(&commander, &keys[1], TransactionBuilder::transfer(1, 2).amount(5));
        let hash = commander.send_transaction(request).unwrap();
        let batch = commander.build_batches(Utc::now()).unwrap().remove(0);

        let submitted = commander
            .mark_batch_submitted(batch.id, H256::repeat_byte(1))
            .unwrap()
            .unwrap();
        assert_eq!(submitted.status, BatchStatus::Submitted);
        commander.mark_batch_mined(batch.id, 100).unwrap();
        assert_eq!(commander.get_transaction(&hash).unwrap().status, TxStatus::Mined);

        assert!(commander.set_latest_block(99).unwrap().is_empty());
        assert_eq!(commander.set_latest_block(100).unwrap(), vec![batch.id]);
        assert_eq!(commander.get_transaction(&hash).unwrap().status, TxStatus::Finalised);
    }

    #[test]
    fn revert_then_submission_report_is_ignored() {
        let (commander, keys) = commander();
        let request = signed(&commander, &keys[1], TransactionBuilder::transfer(1, 2).amount(5));
        commander.send_transaction(request).unwrap();
        let batch = commander.build_batches(Utc::now()).unwrap().remove(0);

        commander.revert_batches(batch.id).unwrap();
        assert_eq!(commander.mempool_size().unwrap(), 1);
        assert!(commander
            .mark_batch_submitted(batch.id, H256::repeat_byte(1))
            .unwrap()
            .is_none());
        assert_eq!(commander.stats().reverts, 1);
    }

    #[test]
    fn admin_operations() {
        let (commander, keys) = commander();
        let request = signed(&commander, &keys[1], TransactionBuilder::transfer(1, 2).amount(5));
        let hash = commander.send_transaction(request).unwrap();

        let check = commander.recompute_pending_state(1, false).unwrap();
        assert!(!check.changed());
        assert_eq!(commander.drop_transaction(1, U256::zero()).unwrap(), hash);
        assert_eq!(commander.get_pending_state(1).unwrap().nonce, U256::zero());

        let replacement = BlsKeypair::from_seed(&[9; 32]).unwrap().public_key();
        let (old, _) = commander.reset_pubkey(2, Some(replacement)).unwrap();
        assert_eq!(old, Some(keys[2].public_key()));

        assert!(commander.register_spoke(4).unwrap());
        assert!(!commander.register_spoke(4).unwrap());
    }
}
