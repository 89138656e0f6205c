//! Pending-state projection.
//!
//! The pending state of an account is its canonical leaf with the account's
//! queued transactions applied in nonce order: each contiguous nonce debits
//! `amount + fee` and bumps the nonce. The fold stops at the first missing
//! nonce, so a gap freezes the projection without discarding anything queued
//! behind it. Receivers are never credited here; only the sender's own
//! queue counts.
//!
//! The projection is cached per account and refreshed whenever its inputs
//! change: admission and drop for the sender, and every state ID a batch
//! build or a revert writes, receivers included. `recompute_pending_state`
//! compares the cache with a fresh fold and optionally repairs it.

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::Mempool;
use crate::error::CommanderResult;
use crate::storage::db::{KvRead, KvWrite, Keyspace};
use crate::storage::state_tree::StateTree;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingState {
    pub nonce: U256,
    pub balance: U256,
}

/// Outcome of [`Mempool::recompute_pending_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecompute {
    pub old_nonce: U256,
    pub old_balance: U256,
    pub new_nonce: U256,
    pub new_balance: U256,
}

impl PendingRecompute {
    pub fn changed(&self) -> bool {
        self.old_nonce != self.new_nonce || self.old_balance != self.new_balance
    }
}

fn pending_key(state_id: u32) -> Vec<u8> {
    Keyspace::PendingState.key(&state_id.to_be_bytes())
}

impl<S: KvRead> Mempool<S> {
    /// Cached projection, or a fresh fold when nothing is cached.
    pub fn pending_state(&self, state_id: u32) -> CommanderResult<PendingState> {
        match self.store.get_value::<PendingState>(&pending_key(state_id))? {
            Some(cached) => Ok(cached),
            None => self.project(state_id),
        }
    }

    pub fn pending_nonce(&self, state_id: u32) -> CommanderResult<U256> {
        Ok(self.pending_state(state_id)?.nonce)
    }

    pub fn pending_balance(&self, state_id: u32) -> CommanderResult<U256> {
        Ok(self.pending_state(state_id)?.balance)
    }

    /// Fold the queue onto the canonical leaf. Never reads the cache.
    pub fn project(&self, state_id: u32) -> CommanderResult<PendingState> {
        let leaf = StateTree::new(&self.store).leaf(state_id)?;
        let mut state = PendingState {
            nonce: leaf.nonce,
            balance: leaf.balance,
        };
        for entry in self.queued_for(state_id)? {
            let nonce = entry.tx.nonce();
            if nonce < state.nonce {
                // Stale entry, already covered by the canonical nonce.
                continue;
            }
            if nonce > state.nonce {
                break;
            }
            state.balance = state.balance.saturating_sub(entry.tx.total_cost()?);
            state.nonce = state.nonce + U256::one();
        }
        Ok(state)
    }
}

impl<S: KvWrite> Mempool<S> {
    /// Compare the cached projection with a fresh fold. With `mutate` the
    /// cache is replaced by the fold (or cleared when the account has
    /// nothing queued); without it nothing is written.
    pub fn recompute_pending_state(
        &mut self,
        state_id: u32,
        mutate: bool,
    ) -> CommanderResult<PendingRecompute> {
        let old = self.pending_state(state_id)?;
        let new = self.project(state_id)?;
        let result = PendingRecompute {
            old_nonce: old.nonce,
            old_balance: old.balance,
            new_nonce: new.nonce,
            new_balance: new.balance,
        };

        if mutate {
            if self.queued_for(state_id)?.is_empty() {
                self.store.delete(&pending_key(state_id));
            } else {
                self.store.put_value(pending_key(state_id), &new)?;
            }
            if result.changed() {
                warn!(
                    state_id,
                    old_nonce = %result.old_nonce,
                    new_nonce = %result.new_nonce,
                    "pending state drifted and was repaired"
                );
            }
        }
        Ok(result)
    }

    /// Rewrite the cached projection after the canonical leaf changed.
    ///
    /// The cache is cleared when nothing is queued for the account or its
    /// leaf no longer exists, as after a revert of the batch that created it.
    pub fn refresh_pending_state(&mut self, state_id: u32) -> CommanderResult<()> {
        let leaf_exists = StateTree::new(&self.store).try_leaf(state_id)?.is_some();
        if !leaf_exists || self.queued_for(state_id)?.is_empty() {
            self.store.delete(&pending_key(state_id));
            return Ok(());
        }
        let projected = self.project(state_id)?;
        self.store.put_value(pending_key(state_id), &projected)?;
        Ok(())
    }
}
