//! Batch persistence.
//!
//! A batch is stored as one record together with its commitments, keyed by
//! its big-endian ID so a prefix scan from any ID yields that batch and all
//! later ones in order. Included transactions get a receipt pointing at
//! their commitment; transactions dropped while being applied are kept with
//! their error message so clients can still look them up.

use primitive_types::H256;
use tracing::debug;

use super::db::{KvRead, KvWrite, Keyspace};
use super::meta_key;
use crate::batch::{Batch, BatchStatus, Commitment, CommitmentId, FailedTx, TxReceipt};
use crate::error::{CommanderResult, NotFound};

const NEXT_BATCH_ID: &str = "next_batch_id";

/// Batch IDs start at 1; 0 is reserved for the genesis state.
pub const FIRST_BATCH_ID: u64 = 1;

fn batch_key(id: u64) -> Vec<u8> {
    Keyspace::Batch.key(&id.to_be_bytes())
}

fn receipt_key(hash: &H256) -> Vec<u8> {
    Keyspace::TxReceipt.key(hash.as_bytes())
}

fn failed_key(hash: &H256) -> Vec<u8> {
    Keyspace::FailedTx.key(hash.as_bytes())
}

pub struct BatchStore<S> {
    store: S,
}

impl<S: KvRead> BatchStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn next_batch_id(&self) -> CommanderResult<u64> {
        Ok(self
            .store
            .get_value::<u64>(&meta_key(NEXT_BATCH_ID))?
            .unwrap_or(FIRST_BATCH_ID))
    }

    pub fn try_batch(&self, id: u64) -> CommanderResult<Option<Batch>> {
        Ok(self.store.get_value(&batch_key(id))?)
    }

    pub fn batch(&self, id: u64) -> CommanderResult<Batch> {
        self.try_batch(id)?.ok_or_else(|| NotFound::Batch(id).into())
    }

    /// `id` and every later batch, ascending.
    pub fn batches_from(&self, id: u64) -> CommanderResult<Vec<Batch>> {
        let mut out = Vec::new();
        for item in self.store.scan_raw(&Keyspace::Batch.prefix()) {
            let (key, value) = item?;
            if key.get(1..) < Some(&id.to_be_bytes()[..]) {
                continue;
            }
            out.push(super::db::decode(&value)?);
        }
        Ok(out)
    }

    /// Every stored batch, ascending.
    pub fn all(&self) -> CommanderResult<Vec<Batch>> {
        self.batches_from(0)
    }

    pub fn latest(&self) -> CommanderResult<Option<Batch>> {
        match self.next_batch_id()?.checked_sub(1) {
            Some(id) if id >= FIRST_BATCH_ID => self.try_batch(id),
            _ => Ok(None),
        }
    }

    pub fn commitment(&self, id: CommitmentId) -> CommanderResult<Commitment> {
        self.try_batch(id.batch_id)?
            .and_then(|batch| batch.commitment(id.index).cloned())
            .ok_or_else(|| NotFound::Commitment(id).into())
    }

    pub fn receipt(&self, hash: &H256) -> CommanderResult<Option<TxReceipt>> {
        Ok(self.store.get_value(&receipt_key(hash))?)
    }

    pub fn failed(&self, hash: &H256) -> CommanderResult<Option<FailedTx>> {
        Ok(self.store.get_value(&failed_key(hash))?)
    }
}

impl<S: KvWrite> BatchStore<S> {
    /// Store a newly built batch and advance the ID counter past it.
    pub fn put(&mut self, batch: &Batch) -> CommanderResult<()> {
        self.store.put_value(batch_key(batch.id), batch)?;
        if batch.id >= self.next_batch_id()? {
            self.store.put_value(meta_key(NEXT_BATCH_ID), &(batch.id + 1))?;
        }
        Ok(())
    }

    /// Overwrite an existing batch record in place.
    pub fn update(&mut self, batch: &Batch) -> CommanderResult<()> {
        self.store.put_value(batch_key(batch.id), batch)?;
        Ok(())
    }

    /// Remove `id` and everything after it, resetting the ID counter to
    /// `id`. Returns the removed batches, ascending.
    pub fn remove_from(&mut self, id: u64) -> CommanderResult<Vec<Batch>> {
        let removed = self.batches_from(id)?;
        for batch in &removed {
            self.store.delete(&batch_key(batch.id));
        }
        self.store.put_value(meta_key(NEXT_BATCH_ID), &id)?;
        debug!(from = id, removed = removed.len(), "batches removed");
        Ok(removed)
    }

    pub fn put_receipt(&mut self, hash: &H256, receipt: &TxReceipt) -> CommanderResult<()> {
        self.store.put_value(receipt_key(hash), receipt)?;
        Ok(())
    }

    pub fn remove_receipt(&mut self, hash: &H256) {
        self.store.delete(&receipt_key(hash));
    }

    pub fn put_failed(&mut self, failed: &FailedTx) -> CommanderResult<()> {
        self.store.put_value(failed_key(&failed.tx.hash()), failed)?;
        Ok(())
    }

    /// Record the base-chain transaction that carried batch `id`.
    pub fn mark_submitted(
        &mut self,
        id: u64,
        transaction_hash: H256,
        at: chrono::DateTime<chrono::Utc>,
    ) -> CommanderResult<Batch> {
        let mut batch = self.batch(id)?;
        batch.status = BatchStatus::Submitted;
        batch.transaction_hash = Some(transaction_hash);
        batch.submission_time = Some(at);
        self.update(&batch)?;
        Ok(batch)
    }

    pub fn mark_mined(&mut self, id: u64, finalisation_block: u64) -> CommanderResult<Batch> {
        let mut batch = self.batch(id)?;
        batch.status = BatchStatus::Mined;
        batch.finalisation_block = Some(finalisation_block);
        self.update(&batch)?;
        Ok(batch)
    }

    /// Finalise every mined batch whose finalisation block is at or below
    /// `latest_block`. Returns the IDs that changed.
    pub fn finalise_up_to(&mut self, latest_block: u64) -> CommanderResult<Vec<u64>> {
        let mut finalised = Vec::new();
        for mut batch in self.all()? {
            let due = batch.status == BatchStatus::Mined
                && batch.finalisation_block.is_some_and(|b| b <= latest_block);
            if due {
                batch.status = BatchStatus::Finalised;
                self.update(&batch)?;
                finalised.push(batch.id);
            }
        }
        Ok(finalised)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchStatus;
    use crate::storage::db::CommanderDb;
    use crate::transaction::TxType;

    fn batch(id: u64) -> Batch {
        Batch {
            id,
            batch_type: TxType::Transfer,
            status: BatchStatus::Pending,
            transaction_hash: None,
            hash: H256::repeat_byte(id as u8),
            finalisation_block: None,
            account_tree_root: H256::zero(),
            prev_state_root: H256::zero(),
            submission_time: None,
            commitments: Vec::new(),
        }
    }

    #[test]
    fn ids_start_at_one_and_advance() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        let mut store = BatchStore::new(&mut txn);
        assert_eq!(store.next_batch_id().unwrap(), 1);
        assert!(store.latest().unwrap().is_none());

        store.put(&batch(1)).unwrap();
        store.put(&batch(2)).unwrap();
        assert_eq!(store.next_batch_id().unwrap(), 3);
        assert_eq!(store.latest().unwrap().unwrap().id, 2);
    }

    #[test]
    fn remove_from_drops_later_batches_and_resets_counter() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        let mut store = BatchStore::new(&mut txn);
        for id in 1..=4 {
            store.put(&batch(id)).unwrap();
        }
        let removed = store.remove_from(3).unwrap();
        assert_eq!(removed.iter().map(|b| b.id).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(store.next_batch_id().unwrap(), 3);
        assert_eq!(store.all().unwrap().len(), 2);

        let err = store.batch(4).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::BatchNotFound);
    }

    #[test]
    fn status_moves_through_lifecycle() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        let mut store = BatchStore::new(&mut txn);
        store.put(&batch(1)).unwrap();
        store.put(&batch(2)).unwrap();

        store
            .mark_submitted(1, H256::repeat_byte(9), chrono::Utc::now())
            .unwrap();
        store.mark_mined(1, 100).unwrap();
        store.mark_mined(2, 110).unwrap();

        assert_eq!(store.finalise_up_to(105).unwrap(), vec![1]);
        assert_eq!(store.batch(1).unwrap().status, BatchStatus::Finalised);
        assert_eq!(store.batch(2).unwrap().status, BatchStatus::Mined);
    }

    #[test]
    fn missing_commitment_reports_its_id() {
        let db = CommanderDb::open_temporary().unwrap();
        let view = db.read();
        let store = BatchStore::new(&view);
        let id = CommitmentId {
            batch_id: 1,
            index: 0,
        };
        let err = store.commitment(id).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::CommitmentNotFound);
    }
}
