//! # State Tree
//!
//! Balances and nonces keyed by state ID, on top of the sparse Merkle
//! engine. Besides the leaves themselves this module keeps:
//!
//! - the `nextAvailableStateID` counter (a `Meta` record),
//! - a `pubKeyID → stateID` index used to find a key's state for a token,
//! - an append-only log of [`StateUpdate`] pre-images, which is the only way
//!   back to an older root. The tree stores no historical snapshots; a
//!   revert undoes updates one by one until the requested root reappears.

use primitive_types::{H256, U256};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use std::collections::BTreeSet;

use super::db::{KvRead, KvWrite, Keyspace};
use super::meta_key;
use crate::crypto::hash::AbiEncoder;
use crate::error::{CommanderError, CommanderResult};
use crate::merkle::{MerkleLeaf, SparseMerkleTree, TreeSpaces, Witness};

pub const STATE_TREE: TreeSpaces = TreeSpaces {
    name: "state",
    leaves: Keyspace::StateLeaf,
    nodes: Keyspace::StateNode,
};

const NEXT_STATE_ID: &str = "next_state_id";
const UPDATE_SEQ: &str = "state_update_seq";

/// State leaf payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserState {
    #[serde(rename = "pubKeyID")]
    pub pub_key_id: u32,
    pub token_id: U256,
    pub balance: U256,
    pub nonce: U256,
}

impl MerkleLeaf for UserState {
    fn leaf_hash(&self) -> H256 {
        AbiEncoder::new()
            .u32(self.pub_key_id)
            .u256(&self.token_id)
            .u256(&self.balance)
            .u256(&self.nonce)
            .hash()
    }
}

/// Pre-image of one leaf write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub state_id: u32,
    pub prev_root: H256,
    pub current_root: H256,
    /// `None` when the write created the leaf.
    pub prev_leaf: Option<UserState>,
    pub prev_next_state_id: u32,
}

pub struct StateTree<S> {
    tree: SparseMerkleTree<S, UserState>,
}

impl<S: KvRead> StateTree<S> {
    pub fn new(store: S) -> Self {
        Self {
            tree: SparseMerkleTree::new(store, STATE_TREE),
        }
    }

    pub fn leaf(&self, state_id: u32) -> CommanderResult<UserState> {
        self.tree.leaf(state_id)
    }

    pub fn try_leaf(&self, state_id: u32) -> CommanderResult<Option<UserState>> {
        self.tree.try_leaf(state_id)
    }

    pub fn root(&self) -> CommanderResult<H256> {
        self.tree.root()
    }

    pub fn witness(&self, state_id: u32) -> CommanderResult<Witness> {
        self.tree.witness(state_id)
    }

    pub fn next_available_state_id(&self) -> CommanderResult<u32> {
        Ok(self
            .tree
            .store()
            .get_value::<u32>(&meta_key(NEXT_STATE_ID))?
            .unwrap_or(0))
    }

    /// Lazily iterate every leaf in state ID order.
    pub fn iterate_leaves(&self) -> impl Iterator<Item = CommanderResult<(u32, UserState)>> + '_ {
        self.tree.leaves()
    }

    /// State IDs owned by `pub_key_id`, ascending.
    pub fn state_ids_of(&self, pub_key_id: u32) -> CommanderResult<Vec<u32>> {
        let prefix = Keyspace::StateByPubKey.key(&pub_key_id.to_be_bytes());
        let mut ids = Vec::new();
        for item in self.tree.store().scan_raw(&prefix) {
            let (key, _) = item?;
            let id = key
                .get(5..9)
                .and_then(|b| <[u8; 4]>::try_from(b).ok())
                .map(u32::from_be_bytes)
                .ok_or_else(|| CommanderError::Internal("malformed state index key".into()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// The lowest state ID owned by `pub_key_id` holding `token_id`.
    pub fn find_by_token(
        &self,
        pub_key_id: u32,
        token_id: &U256,
    ) -> CommanderResult<Option<(u32, UserState)>> {
        for id in self.state_ids_of(pub_key_id)? {
            let leaf = self.leaf(id)?;
            if leaf.token_id == *token_id {
                return Ok(Some((id, leaf)));
            }
        }
        Ok(None)
    }

    /// Number of recorded pre-images.
    pub fn update_count(&self) -> CommanderResult<u64> {
        Ok(self
            .tree
            .store()
            .get_value::<u64>(&meta_key(UPDATE_SEQ))?
            .unwrap_or(0))
    }

    /// State IDs written by updates recorded at or after `from_seq`.
    pub fn touched_since(&self, from_seq: u64) -> CommanderResult<BTreeSet<u32>> {
        let mut touched = BTreeSet::new();
        for seq in from_seq..self.update_count()? {
            let update: StateUpdate = self
                .tree
                .store()
                .get_value(&Keyspace::StateUpdate.key(&seq.to_be_bytes()))?
                .ok_or_else(|| CommanderError::Internal(format!("missing state update {seq}")))?;
            touched.insert(update.state_id);
        }
        Ok(touched)
    }
}

fn index_key(pub_key_id: u32, state_id: u32) -> Vec<u8> {
    let mut suffix = [0u8; 8];
    suffix[..4].copy_from_slice(&pub_key_id.to_be_bytes());
    suffix[4..].copy_from_slice(&state_id.to_be_bytes());
    Keyspace::StateByPubKey.key(&suffix)
}

impl<S: KvWrite> StateTree<S> {
    /// Write a leaf, record its pre-image, and return the new witness.
    pub fn set(&mut self, state_id: u32, state: &UserState) -> CommanderResult<Witness> {
        let prev_root = self.root()?;
        let prev_leaf = self.try_leaf(state_id)?;
        let prev_next_state_id = self.next_available_state_id()?;

        let current_root = self.tree.set_leaf(state_id, state)?;

        let store = self.tree.store_mut();
        if let Some(prev) = &prev_leaf {
            if prev.pub_key_id != state.pub_key_id {
                store.delete(&index_key(prev.pub_key_id, state_id));
            }
        }
        store.put_raw(index_key(state.pub_key_id, state_id), Vec::new());
        if state_id >= prev_next_state_id {
            store.put_value(meta_key(NEXT_STATE_ID), &state_id.saturating_add(1))?;
        }

        let seq = store.get_value::<u64>(&meta_key(UPDATE_SEQ))?.unwrap_or(0);
        store.put_value(
            Keyspace::StateUpdate.key(&seq.to_be_bytes()),
            &StateUpdate {
                state_id,
                prev_root,
                current_root,
                prev_leaf,
                prev_next_state_id,
            },
        )?;
        store.put_value(meta_key(UPDATE_SEQ), &(seq + 1))?;

        self.witness(state_id)
    }

    /// Create a leaf at the next available state ID.
    pub fn create(&mut self, state: &UserState) -> CommanderResult<(u32, Witness)> {
        let state_id = self.next_available_state_id()?;
        let witness = self.set(state_id, state)?;
        Ok((state_id, witness))
    }

    /// Undo recorded updates, newest first, until the root equals `target`.
    /// Returns the state IDs whose leaves were rewritten.
    ///
    /// Fails with `NonexistentState` when the log runs out first. There is
    /// no safe partial result: callers must abandon the enclosing write
    /// transaction on error.
    pub fn revert_to(&mut self, target: H256) -> CommanderResult<BTreeSet<u32>> {
        let mut current = self.root()?;
        let mut touched = BTreeSet::new();
        if current == target {
            return Ok(touched);
        }

        let mut seq = self.update_count()?;
        let mut undone = 0u64;
        while seq > 0 {
            seq -= 1;
            let key = Keyspace::StateUpdate.key(&seq.to_be_bytes());
            let update: StateUpdate = self
                .tree
                .store()
                .get_value(&key)?
                .ok_or_else(|| CommanderError::Internal(format!("missing state update {seq}")))?;
            if update.current_root != current {
                error!(seq, ?current, expected = ?update.current_root, "state update log out of sync");
                return Err(CommanderError::NonexistentState(target));
            }

            self.undo(&update)?;
            let store = self.tree.store_mut();
            store.delete(&key);
            store.put_value(meta_key(UPDATE_SEQ), &seq)?;
            touched.insert(update.state_id);
            undone += 1;

            current = self.root()?;
            if current != update.prev_root {
                return Err(CommanderError::Internal(format!(
                    "undoing state update {seq} produced an unexpected root"
                )));
            }
            if current == target {
                debug!(undone, root = ?target, "state tree reverted");
                return Ok(touched);
            }
        }

        error!(root = ?target, undone, "state tree root not found in update log");
        Err(CommanderError::NonexistentState(target))
    }

    fn undo(&mut self, update: &StateUpdate) -> CommanderResult<()> {
        let replaced = self.try_leaf(update.state_id)?;
        match &update.prev_leaf {
            Some(prev) => {
                self.tree.set_leaf(update.state_id, prev)?;
            }
            None => {
                self.tree.clear_leaf(update.state_id)?;
            }
        }

        let store = self.tree.store_mut();
        if let Some(replaced) = replaced {
            store.delete(&index_key(replaced.pub_key_id, update.state_id));
        }
        if let Some(prev) = &update.prev_leaf {
            store.put_raw(index_key(prev.pub_key_id, update.state_id), Vec::new());
        }
        store.put_value(meta_key(NEXT_STATE_ID), &update.prev_next_state_id)?;
        Ok(())
    }
}
