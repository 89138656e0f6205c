//! Dispute rollback.
//!
//! When the base chain reports a successful dispute against batch `B`, the
//! state tree goes back to the root `B` started from, `B` and every later
//! batch are deleted and their transactions return to the mempool under
//! their original arrival numbers. They are not re-validated here; the
//! builder re-checks them when it applies them again. Pending projections
//! are refreshed for every state the rollback rewrote and every requeued
//! sender; states the reverted batches created lose their cache.
//!
//! The account tree is append-only and is left as is. Keys registered by
//! reverted create-and-transfers stay registered and are reused on rebuild.

use primitive_types::H256;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CommanderError, CommanderResult, NotFound};
use crate::mempool::{Mempool, PendingTx};
use crate::storage::batches::BatchStore;
use crate::storage::db::WriteTxn;
use crate::storage::state_tree::StateTree;
use crate::transaction::Transaction;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertOutcome {
    pub reverted_batches: Vec<u64>,
    pub requeued: usize,
    pub state_root: H256,
}

/// Revert `batch_id` and everything after it inside `txn`.
///
/// Any error leaves `txn` in an unusable state; the caller must drop it.
pub fn revert_batches(txn: &mut WriteTxn<'_>, batch_id: u64) -> CommanderResult<RevertOutcome> {
    let batches = BatchStore::new(&*txn).batches_from(batch_id)?;
    let Some(first) = batches.first() else {
        return Err(NotFound::Batch(batch_id).into());
    };
    if first.id != batch_id {
        return Err(NotFound::Batch(batch_id).into());
    }
    let target = first.prev_state_root;

    let mut touched = StateTree::new(&mut *txn).revert_to(target)?;

    let mut requeued = 0;
    for batch in &batches {
        for commitment in &batch.commitments {
            for tx in &commitment.transactions {
                let hash = tx.hash();
                let receipt = BatchStore::new(&*txn).receipt(&hash)?.ok_or_else(|| {
                    CommanderError::Internal(format!("included transaction {hash:?} has no receipt"))
                })?;
                BatchStore::new(&mut *txn).remove_receipt(&hash);
                Mempool::new(&mut *txn).requeue(PendingTx {
                    tx: unapplied(tx),
                    seq: receipt.arrival_seq,
                })?;
                touched.insert(tx.from_state_id());
                requeued += 1;
            }
        }
    }

    let removed = BatchStore::new(&mut *txn).remove_from(batch_id)?;
    let mut mempool = Mempool::new(&mut *txn);
    for state_id in touched {
        mempool.refresh_pending_state(state_id)?;
    }

    let reverted_batches: Vec<u64> = removed.iter().map(|b| b.id).collect();
    warn!(
        from = batch_id,
        batches = reverted_batches.len(),
        requeued,
        state_root = ?target,
        "batches reverted"
    );
    info!(next_batch_id = batch_id, "batch counter reset");
    Ok(RevertOutcome {
        reverted_batches,
        requeued,
        state_root: target,
    })
}

/// The transaction as it was queued, before the builder filled in
/// destination IDs.
fn unapplied(tx: &Transaction) -> Transaction {
    let mut tx = tx.clone();
    if let Transaction::Create2Transfer(c2t) = &mut tx {
        c2t.to_state_id = None;
        c2t.to_pub_key_id = None;
    }
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::builder::BatchBuilder;
    use crate::batch::Batch;
    use crate::config::RollupConfig;
    use crate::crypto::BlsKeypair;
    use crate::storage::db::CommanderDb;
    use crate::storage::state_tree::UserState;
    use crate::transaction::{TransactionBuilder, TxType};
    use chrono::Utc;
    use primitive_types::U256;

    fn config() -> RollupConfig {
        RollupConfig {
            disable_signatures: true,
            max_txs_per_commitment: 1,
            ..RollupConfig::default()
        }
    }

    fn setup() -> CommanderDb {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        for id in 0..3u32 {
            StateTree::new(&mut txn)
                .set(
                    id,
                    &UserState {
                        pub_key_id: id,
                        token_id: U256::zero(),
                        balance: 420.into(),
                        nonce: U256::zero(),
                    },
                )
                .unwrap();
        }
        txn.commit().unwrap();
        db
    }

    fn queue_and_build(db: &CommanderDb, txs: Vec<Transaction>, batch_type: TxType) -> Batch {
        let mut txn = db.begin();
        let mut mempool = Mempool::new(&mut txn);
        for tx in txs {
            mempool.insert(tx).unwrap();
        }
        let batch = BatchBuilder::new(&config())
            .build_batch(&mut txn, batch_type, Utc::now())
            .unwrap()
            .batch
            .unwrap();
        txn.commit().unwrap();
        batch
    }

    fn revert(db: &CommanderDb, batch_id: u64) -> CommanderResult<RevertOutcome> {
        let mut txn = db.begin();
        let outcome = revert_batches(&mut txn, batch_id)?;
        txn.commit()?;
        Ok(outcome)
    }

    #[test]
    fn revert_restores_state_and_mempool() {
        let db = setup();
        let genesis = StateTree::new(db.read()).root().unwrap();
        let first = queue_and_build(
            &db,
            vec![TransactionBuilder::transfer(1, 2).amount(50).fee(10).build()],
            TxType::Transfer,
        );
        let second = queue_and_build(
            &db,
            vec![TransactionBuilder::transfer(2, 1).amount(5).build()],
            TxType::Transfer,
        );
        assert_eq!(second.id, first.id + 1);

        let outcome = revert(&db, first.id).unwrap();
        assert_eq!(outcome.reverted_batches, vec![first.id, second.id]);
        assert_eq!(outcome.requeued, 2);
        assert_eq!(outcome.state_root, genesis);

        let view = db.read();
        assert_eq!(StateTree::new(&view).root().unwrap(), genesis);
        assert_eq!(Mempool::new(&view).len().unwrap(), 2);
        assert_eq!(Mempool::new(&view).pending_nonce(1).unwrap(), U256::one());
        let store = BatchStore::new(&view);
        assert!(store.try_batch(first.id).unwrap().is_none());
        assert_eq!(store.next_batch_id().unwrap(), first.id);
        let hash = first.commitments[0].transactions[0].hash();
        assert!(store.receipt(&hash).unwrap().is_none());
    }

    #[test]
    fn rebuild_after_revert_reproduces_roots() {
        let db = setup();
        let key = BlsKeypair::from_seed(&[3; 32]).unwrap().public_key();
        let original = queue_and_build(
            &db,
            vec![
                TransactionBuilder::create2transfer(1, key).amount(50).fee(10).build(),
                TransactionBuilder::create2transfer(2, key).amount(20).fee(1).build(),
            ],
            TxType::Create2Transfer,
        );

        revert(&db, original.id).unwrap();

        let mut txn = db.begin();
        let rebuilt = BatchBuilder::new(&config())
            .build_batch(&mut txn, TxType::Create2Transfer, Utc::now())
            .unwrap()
            .batch
            .unwrap();
        txn.commit().unwrap();

        assert_eq!(rebuilt.id, original.id);
        assert_eq!(rebuilt.post_state_root(), original.post_state_root());
        assert_eq!(rebuilt.hash, original.hash);
        assert_eq!(rebuilt.commitments, original.commitments);
    }

    #[test]
    fn revert_refreshes_pending_state_of_receivers() {
        let db = setup();
        let batch = queue_and_build(
            &db,
            vec![TransactionBuilder::transfer(1, 2).amount(100).build()],
            TxType::Transfer,
        );

        // State 2 spends most of what it just received.
        let mut txn = db.begin();
        Mempool::new(&mut txn)
            .insert(TransactionBuilder::transfer(2, 1).amount(400).build())
            .unwrap();
        txn.commit().unwrap();
        let pending = Mempool::new(db.read()).pending_state(2).unwrap();
        assert_eq!(pending.balance, U256::from(120));

        revert(&db, batch.id).unwrap();

        let view = db.read();
        let mempool = Mempool::new(&view);
        let pending = mempool.pending_state(2).unwrap();
        assert_eq!(pending.nonce, U256::one());
        assert_eq!(pending.balance, U256::from(20));
        for id in 0..3 {
            assert_eq!(mempool.pending_state(id).unwrap(), mempool.project(id).unwrap());
        }
        assert_eq!(mempool.pending_balance(1).unwrap(), U256::from(320));
    }

    #[test]
    fn revert_spanning_a_created_state() {
        let db = setup();
        let key = BlsKeypair::from_seed(&[9; 32]).unwrap().public_key();
        let created = queue_and_build(
            &db,
            vec![TransactionBuilder::create2transfer(1, key).amount(50).fee(10).build()],
            TxType::Create2Transfer,
        );
        let new_state = 3;
        assert_eq!(
            StateTree::new(db.read()).leaf(new_state).unwrap().balance,
            U256::from(50)
        );
        let spent = queue_and_build(
            &db,
            vec![TransactionBuilder::transfer(new_state, 2).amount(20).fee(1).build()],
            TxType::Transfer,
        );
        let mut txn = db.begin();
        Mempool::new(&mut txn)
            .insert(
                TransactionBuilder::transfer(new_state, 2)
                    .amount(5)
                    .fee(1)
                    .nonce(1)
                    .build(),
            )
            .unwrap();
        txn.commit().unwrap();

        let outcome = revert(&db, created.id).unwrap();
        assert_eq!(outcome.reverted_batches, vec![created.id, spent.id]);
        assert_eq!(outcome.requeued, 2);

        {
            let view = db.read();
            assert!(StateTree::new(&view).try_leaf(new_state).unwrap().is_none());
            let mempool = Mempool::new(&view);
            assert_eq!(mempool.queued_for(new_state).unwrap().len(), 2);
            // No cached projection survives for the removed leaf.
            let err = mempool.pending_state(new_state).unwrap_err();
            assert!(matches!(
                err,
                CommanderError::NotFound(NotFound::Leaf { index: 3, .. })
            ));
            assert_eq!(mempool.pending_nonce(1).unwrap(), U256::one());
            assert_eq!(mempool.pending_balance(1).unwrap(), U256::from(360));
        }

        let rebuilt = queue_and_build(&db, Vec::new(), TxType::Create2Transfer);
        assert_eq!(rebuilt.hash, created.hash);
        queue_and_build(&db, Vec::new(), TxType::Transfer);

        let view = db.read();
        let leaf = StateTree::new(&view).leaf(new_state).unwrap();
        assert_eq!(leaf.nonce, U256::from(2));
        assert_eq!(leaf.balance, U256::from(50 - 21 - 6));
        assert!(Mempool::new(&view).is_empty().unwrap());
    }

    #[test]
    fn reverting_unknown_batch_fails() {
        let db = setup();
        let err = revert(&db, 4).unwrap_err();
        assert!(matches!(err, CommanderError::NotFound(NotFound::Batch(4))));
    }
}
