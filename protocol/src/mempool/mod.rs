//! # Mempool
//!
//! Validated, not-yet-committed transactions, persisted in the same store
//! as the trees so that admitting a transaction, including it in a
//! commitment and re-queuing it after a revert are each a single atomic
//! write.
//!
//! ## Layout
//!
//! - `MempoolTx`: `stateID ‖ nonce` → [`PendingTx`]. Big-endian keys make a
//!   prefix scan over one state ID yield its queue in nonce order.
//! - `MempoolHash`: `txHash` → `(stateID, nonce)`.
//! - `PendingState`: `stateID` → cached [`PendingState`] projection (see
//!   [`pending`]). Absent when the account has nothing queued.
//!
//! Arrival order across accounts comes from a persisted sequence number
//! stamped on every entry. Re-queued transactions keep their original
//! number so that a rebuild after a revert selects them in the same order.

pub mod pending;

use std::collections::BTreeMap;

use primitive_types::{H256, U256};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CommanderError, CommanderResult, NotFound};
use crate::storage::db::{KvRead, KvWrite, Keyspace};
use crate::storage::meta_key;
use crate::transaction::Transaction;

pub use pending::{PendingRecompute, PendingState};

const ARRIVAL_SEQ: &str = "mempool_seq";

/// A queued transaction and its arrival position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTx {
    pub tx: Transaction,
    pub seq: u64,
}

pub(crate) fn tx_key(state_id: u32, nonce: &U256) -> Vec<u8> {
    let mut suffix = [0u8; 36];
    suffix[..4].copy_from_slice(&state_id.to_be_bytes());
    nonce.to_big_endian(&mut suffix[4..]);
    Keyspace::MempoolTx.key(&suffix)
}

fn hash_key(hash: &H256) -> Vec<u8> {
    Keyspace::MempoolHash.key(hash.as_bytes())
}

/// What happened to a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Newly queued.
    Queued,
    /// Byte-identical transaction already queued; nothing changed.
    AlreadyQueued,
}

/// Queue operations over a storage handle.
pub struct Mempool<S> {
    store: S,
}

impl<S: KvRead> Mempool<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn get(&self, state_id: u32, nonce: &U256) -> CommanderResult<Option<PendingTx>> {
        Ok(self.store.get_value(&tx_key(state_id, nonce))?)
    }

    pub fn by_hash(&self, hash: &H256) -> CommanderResult<Option<PendingTx>> {
        match self.store.get_value::<(u32, U256)>(&hash_key(hash))? {
            Some((state_id, nonce)) => self.get(state_id, &nonce),
            None => Ok(None),
        }
    }

    /// Everything queued for `state_id`, ascending by nonce.
    pub fn queued_for(&self, state_id: u32) -> CommanderResult<Vec<PendingTx>> {
        let prefix = Keyspace::MempoolTx.key(&state_id.to_be_bytes());
        self.store
            .scan_raw(&prefix)
            .map(|item| -> CommanderResult<PendingTx> {
                let (_, value) = item?;
                Ok(crate::storage::db::decode(&value)?)
            })
            .collect()
    }

    /// Every queued transaction grouped by sender, each queue in nonce order.
    pub fn by_sender(&self) -> CommanderResult<BTreeMap<u32, Vec<PendingTx>>> {
        let mut out: BTreeMap<u32, Vec<PendingTx>> = BTreeMap::new();
        for item in self.store.scan_raw(&Keyspace::MempoolTx.prefix()) {
            let (_, value) = item?;
            let entry: PendingTx = crate::storage::db::decode(&value)?;
            out.entry(entry.tx.from_state_id()).or_default().push(entry);
        }
        Ok(out)
    }

    pub fn len(&self) -> CommanderResult<usize> {
        let mut n = 0;
        for item in self.store.scan_raw(&Keyspace::MempoolHash.prefix()) {
            item?;
            n += 1;
        }
        Ok(n)
    }

    pub fn is_empty(&self) -> CommanderResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Duplicate rule for `(stateID, nonce)`: the same transaction again is
    /// reported as already queued, a different one is rejected.
    pub fn check_duplicate(&self, tx: &Transaction) -> CommanderResult<Option<Admission>> {
        match self.get(tx.from_state_id(), &tx.nonce())? {
            None => Ok(None),
            Some(existing) if existing.tx.hash() == tx.hash() => Ok(Some(Admission::AlreadyQueued)),
            Some(_) => Err(CommanderError::PendingTransaction {
                state_id: tx.from_state_id(),
                nonce: tx.nonce(),
            }),
        }
    }

    fn next_seq(&self) -> CommanderResult<u64> {
        Ok(self.store.get_value::<u64>(&meta_key(ARRIVAL_SEQ))?.unwrap_or(0))
    }
}

impl<S: KvWrite> Mempool<S> {
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Queue an already validated transaction and refresh its sender's
    /// pending projection.
    pub fn insert(&mut self, tx: Transaction) -> CommanderResult<Admission> {
        if let Some(admission) = self.check_duplicate(&tx)? {
            return Ok(admission);
        }
        let seq = self.next_seq()?;
        self.store.put_value(meta_key(ARRIVAL_SEQ), &(seq + 1))?;
        let state_id = tx.from_state_id();
        self.requeue(PendingTx { tx, seq })?;
        self.recompute_pending_state(state_id, true)?;
        Ok(Admission::Queued)
    }

    /// Put an entry back under its original arrival number. Does not touch
    /// the pending projection; callers recompute once they are done.
    pub fn requeue(&mut self, entry: PendingTx) -> CommanderResult<()> {
        let state_id = entry.tx.from_state_id();
        let nonce = entry.tx.nonce();
        self.store
            .put_value(hash_key(&entry.tx.hash()), &(state_id, nonce))?;
        self.store.put_value(tx_key(state_id, &nonce), &entry)?;
        Ok(())
    }

    /// Remove one entry without touching the pending projection.
    pub fn remove(&mut self, state_id: u32, nonce: &U256) -> CommanderResult<Option<PendingTx>> {
        let Some(entry) = self.get(state_id, nonce)? else {
            return Ok(None);
        };
        self.store.delete(&tx_key(state_id, nonce));
        self.store.delete(&hash_key(&entry.tx.hash()));
        Ok(Some(entry))
    }

    /// Administrative removal of one queued transaction.
    pub fn drop_transaction(&mut self, state_id: u32, nonce: &U256) -> CommanderResult<PendingTx> {
        let entry = self.remove(state_id, nonce)?.ok_or(NotFound::PendingTransaction {
            state_id,
            nonce: *nonce,
        })?;
        self.recompute_pending_state(state_id, true)?;
        debug!(state_id, %nonce, hash = ?entry.tx.hash(), "transaction dropped from mempool");
        Ok(entry)
    }
}
