//! # Account Tree
//!
//! Public keys keyed by `pubKeyID`. Normal registration is write-once; the
//! only way to overwrite or clear a leaf is [`AccountTree::unsafe_reset`],
//! reserved for trusted repair tooling.
//!
//! IDs below `2^31 - 1` form the left subtree, used for single
//! registrations. A `Meta` counter tracks the next vacant ID there.

use primitive_types::H256;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::db::{KvRead, KvWrite, Keyspace};
use super::meta_key;
use crate::crypto::PublicKey;
use crate::error::{CommanderError, CommanderResult};
use crate::merkle::{MerkleLeaf, SparseMerkleTree, TreeSpaces, Witness};

pub const ACCOUNT_TREE: TreeSpaces = TreeSpaces {
    name: "account",
    leaves: Keyspace::AccountLeaf,
    nodes: Keyspace::AccountNode,
};

/// Highest pubKeyID that single registrations may use.
pub const LEFT_SUBTREE_MAX: u32 = (1 << 31) - 2;

const NEXT_PUB_KEY_ID: &str = "next_pub_key_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLeaf {
    pub pub_key_id: u32,
    pub public_key: PublicKey,
}

impl MerkleLeaf for AccountLeaf {
    fn leaf_hash(&self) -> H256 {
        self.public_key.hash()
    }
}

pub struct AccountTree<S> {
    tree: SparseMerkleTree<S, AccountLeaf>,
}

fn by_key(public_key: &PublicKey, pub_key_id: u32) -> Vec<u8> {
    let mut suffix = Vec::with_capacity(36);
    suffix.extend_from_slice(public_key.hash().as_bytes());
    suffix.extend_from_slice(&pub_key_id.to_be_bytes());
    Keyspace::AccountByKey.key(&suffix)
}

impl<S: KvRead> AccountTree<S> {
    pub fn new(store: S) -> Self {
        Self {
            tree: SparseMerkleTree::new(store, ACCOUNT_TREE),
        }
    }

    pub fn leaf(&self, pub_key_id: u32) -> CommanderResult<AccountLeaf> {
        self.tree.leaf(pub_key_id)
    }

    pub fn try_leaf(&self, pub_key_id: u32) -> CommanderResult<Option<AccountLeaf>> {
        self.tree.try_leaf(pub_key_id)
    }

    pub fn root(&self) -> CommanderResult<H256> {
        self.tree.root()
    }

    pub fn witness(&self, pub_key_id: u32) -> CommanderResult<Witness> {
        self.tree.witness(pub_key_id)
    }

    /// Every pubKeyID registered for `public_key`, ascending.
    pub fn ids_for_key(&self, public_key: &PublicKey) -> CommanderResult<Vec<u32>> {
        let prefix = Keyspace::AccountByKey.key(public_key.hash().as_bytes());
        let mut ids = Vec::new();
        for item in self.tree.store().scan_raw(&prefix) {
            let (key, _) = item?;
            let id = key
                .get(33..37)
                .and_then(|b| <[u8; 4]>::try_from(b).ok())
                .map(u32::from_be_bytes)
                .ok_or_else(|| CommanderError::Internal("malformed account index key".into()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Next vacant ID in the left subtree.
    pub fn next_pub_key_id(&self) -> CommanderResult<u32> {
        Ok(self
            .tree
            .store()
            .get_value::<u32>(&meta_key(NEXT_PUB_KEY_ID))?
            .unwrap_or(0))
    }
}

impl<S: KvWrite> AccountTree<S> {
    /// Register a leaf. Rejects IDs outside the left subtree and IDs that
    /// are already taken.
    pub fn set_single(&mut self, leaf: &AccountLeaf) -> CommanderResult<Witness> {
        if leaf.pub_key_id > LEFT_SUBTREE_MAX {
            return Err(CommanderError::InvalidPubKeyId(leaf.pub_key_id));
        }
        if self.try_leaf(leaf.pub_key_id)?.is_some() {
            return Err(CommanderError::AccountAlreadyExists(leaf.pub_key_id));
        }

        self.tree.set_leaf(leaf.pub_key_id, leaf)?;
        let next = self.next_pub_key_id()?;
        let store = self.tree.store_mut();
        store.put_raw(by_key(&leaf.public_key, leaf.pub_key_id), Vec::new());
        if leaf.pub_key_id >= next {
            store.put_value(meta_key(NEXT_PUB_KEY_ID), &(leaf.pub_key_id + 1))?;
        }
        self.witness(leaf.pub_key_id)
    }

    /// Register `public_key` at the next vacant left-subtree ID.
    pub fn register_next(&mut self, public_key: PublicKey) -> CommanderResult<u32> {
        let pub_key_id = self.next_pub_key_id()?;
        if pub_key_id > LEFT_SUBTREE_MAX {
            return Err(CommanderError::NoVacantSubtree);
        }
        self.set_single(&AccountLeaf {
            pub_key_id,
            public_key,
        })?;
        Ok(pub_key_id)
    }

    /// Overwrite (or clear, with `None`) a leaf regardless of write-once
    /// protection. Returns the previous key and the new root.
    pub fn unsafe_reset(
        &mut self,
        pub_key_id: u32,
        public_key: Option<PublicKey>,
    ) -> CommanderResult<(Option<PublicKey>, H256)> {
        let old = self.try_leaf(pub_key_id)?.map(|leaf| leaf.public_key);
        if let Some(old_key) = &old {
            self.tree.store_mut().delete(&by_key(old_key, pub_key_id));
        }

        let root = match public_key {
            Some(public_key) => {
                let root = self.tree.set_leaf(
                    pub_key_id,
                    &AccountLeaf {
                        pub_key_id,
                        public_key,
                    },
                )?;
                self.tree
                    .store_mut()
                    .put_raw(by_key(&public_key, pub_key_id), Vec::new());
                root
            }
            None => self.tree.clear_leaf(pub_key_id)?,
        };

        warn!(
            pub_key_id,
            old = ?old.map(|k| k.to_hex()),
            new = ?public_key.map(|k| k.to_hex()),
            "account leaf reset"
        );
        Ok((old, root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::BlsKeypair;
    use crate::merkle::zero_hash;
    use crate::storage::db::CommanderDb;

    fn key(seed: u8) -> PublicKey {
        BlsKeypair::from_seed(&[seed; 32]).unwrap().public_key()
    }

    #[test]
    fn set_single_is_write_once() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        let mut tree = AccountTree::new(&mut txn);
        let leaf = AccountLeaf {
            pub_key_id: 0,
            public_key: key(1),
        };
        let w = tree.set_single(&leaf).unwrap();
        assert!(w.verify(&tree.root().unwrap(), key(1).hash()));

        let again = AccountLeaf {
            pub_key_id: 0,
            public_key: key(2),
        };
        assert!(matches!(
            tree.set_single(&again),
            Err(CommanderError::AccountAlreadyExists(0))
        ));
        assert_eq!(tree.leaf(0).unwrap().public_key, key(1));
    }

    #[test]
    fn right_subtree_ids_are_rejected() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        let mut tree = AccountTree::new(&mut txn);
        let leaf = AccountLeaf {
            pub_key_id: LEFT_SUBTREE_MAX + 1,
            public_key: key(1),
        };
        assert!(matches!(
            tree.set_single(&leaf),
            Err(CommanderError::InvalidPubKeyId(_))
        ));
    }

    #[test]
    fn register_next_allocates_after_highest_id() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        let mut tree = AccountTree::new(&mut txn);
        tree.set_single(&AccountLeaf {
            pub_key_id: 4,
            public_key: key(1),
        })
        .unwrap();
        assert_eq!(tree.register_next(key(2)).unwrap(), 5);
        assert_eq!(tree.ids_for_key(&key(2)).unwrap(), vec![5]);
    }

    #[test]
    fn exhausted_left_subtree() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        let mut tree = AccountTree::new(&mut txn);
        tree.set_single(&AccountLeaf {
            pub_key_id: LEFT_SUBTREE_MAX,
            public_key: key(1),
        })
        .unwrap();
        assert!(matches!(
            tree.register_next(key(2)),
            Err(CommanderError::NoVacantSubtree)
        ));
    }

    #[test]
    fn unsafe_reset_returns_old_key_and_clears() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        let mut tree = AccountTree::new(&mut txn);
        tree.set_single(&AccountLeaf {
            pub_key_id: 3,
            public_key: key(1),
        })
        .unwrap();

        let (old, root) = tree.unsafe_reset(3, Some(key(2))).unwrap();
        assert_eq!(old, Some(key(1)));
        assert_eq!(root, tree.root().unwrap());
        assert!(tree.ids_for_key(&key(1)).unwrap().is_empty());
        assert_eq!(tree.ids_for_key(&key(2)).unwrap(), vec![3]);

        let (old, root) = tree.unsafe_reset(3, None).unwrap();
        assert_eq!(old, Some(key(2)));
        assert_eq!(root, zero_hash(crate::merkle::TREE_DEPTH));
        assert!(tree.try_leaf(3).unwrap().is_none());
    }
}
