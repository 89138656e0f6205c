//! Persisted sparse Merkle tree of fixed depth.
//!
//! Leaf payloads and node hashes live under two separate keyspaces. Nodes
//! equal to the empty-subtree hash of their height are never stored (and are
//! deleted when a subtree becomes empty again), so an untouched tree costs
//! nothing on disk and its root is simply `zero_hash(32)`.
//!
//! The tree does not own its storage handle's transactional semantics: with
//! a `ReadView` it is read-only, with a `&mut WriteTxn` every write is
//! staged in that transaction.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use primitive_types::H256;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{zero_hash, MerklePath, Witness, TREE_DEPTH};
use crate::crypto::hash_two;
use crate::error::{CommanderError, CommanderResult};
use crate::storage::db::{decode, KvRead, KvWrite, Keyspace, StorageError};

/// A leaf payload that knows its own hash.
pub trait MerkleLeaf: Serialize + DeserializeOwned {
    fn leaf_hash(&self) -> H256;
}

/// Where a tree keeps its leaves and nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeSpaces {
    pub name: &'static str,
    pub leaves: Keyspace,
    pub nodes: Keyspace,
}

/// Sparse Merkle tree over a key-value store.
pub struct SparseMerkleTree<S, L> {
    store: S,
    spaces: TreeSpaces,
    _leaf: PhantomData<fn() -> L>,
}

impl<S: KvRead, L: MerkleLeaf> SparseMerkleTree<S, L> {
    pub fn new(store: S, spaces: TreeSpaces) -> Self {
        Self {
            store,
            spaces,
            _leaf: PhantomData,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn name(&self) -> &'static str {
        self.spaces.name
    }

    fn leaf_key(&self, index: u32) -> Vec<u8> {
        self.spaces.leaves.key(&index.to_be_bytes())
    }

    fn node_key(&self, path: &MerklePath) -> Vec<u8> {
        self.spaces.nodes.key(&path.key_bytes())
    }

    pub fn try_leaf(&self, index: u32) -> CommanderResult<Option<L>> {
        Ok(self.store.get_value(&self.leaf_key(index))?)
    }

    /// Payload of a leaf that must exist.
    pub fn leaf(&self, index: u32) -> CommanderResult<L> {
        self.try_leaf(index)?
            .ok_or_else(|| CommanderError::leaf_not_found(self.spaces.name, index))
    }

    /// Hash stored at `path`, or the empty-subtree hash for its height.
    pub fn node(&self, path: &MerklePath) -> CommanderResult<H256> {
        match self.store.get_raw(&self.node_key(path))? {
            Some(bytes) if bytes.len() == 32 => Ok(H256::from_slice(&bytes)),
            Some(_) => Err(StorageError::Corrupted(format!("{} node", self.spaces.name)).into()),
            None => Ok(zero_hash(TREE_DEPTH - path.depth)),
        }
    }

    pub fn root(&self) -> CommanderResult<H256> {
        self.node(&MerklePath::ROOT)
    }

    /// Sibling hashes for `index`, leaf-to-root.
    pub fn witness(&self, index: u32) -> CommanderResult<Witness> {
        let leaf = MerklePath::leaf(index, TREE_DEPTH);
        let mut siblings = Vec::with_capacity(TREE_DEPTH as usize);
        let mut current = leaf;
        while !current.is_root() {
            siblings.push(self.node(&current.sibling())?);
            current = current.parent();
        }
        Ok(Witness {
            path: leaf,
            siblings,
        })
    }

    /// Every populated leaf in index order. Lazy: each call starts a fresh
    /// scan, so the iterator can be restarted by calling again.
    pub fn leaves(&self) -> impl Iterator<Item = CommanderResult<(u32, L)>> + '_ {
        self.store
            .scan_raw(&self.spaces.leaves.prefix())
            .map(|item| -> CommanderResult<(u32, L)> {
                let (key, value) = item?;
                let index_bytes: [u8; 4] = key
                    .get(1..5)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| StorageError::Corrupted("leaf key".into()))?;
                let leaf: L = decode(&value)?;
                Ok((u32::from_be_bytes(index_bytes), leaf))
            })
    }
}

impl<S: KvWrite, L: MerkleLeaf> SparseMerkleTree<S, L> {
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Replace a leaf's payload and return the new root. Only the `depth`
    /// nodes on the leaf's path are recomputed.
    pub fn set_leaf(&mut self, index: u32, payload: &L) -> CommanderResult<H256> {
        let key = self.leaf_key(index);
        self.store.put_value(key, payload)?;
        self.update_path(index, payload.leaf_hash())
    }

    /// Return a leaf to the empty state.
    pub fn clear_leaf(&mut self, index: u32) -> CommanderResult<H256> {
        let key = self.leaf_key(index);
        self.store.delete(&key);
        self.update_path(index, zero_hash(0))
    }

    /// Apply several leaf updates at once. Later entries for the same index
    /// win; the resulting root equals applying them one by one.
    pub fn set_leaves(&mut self, updates: &[(u32, L)]) -> CommanderResult<H256> {
        let mut dirty: BTreeMap<u32, H256> = BTreeMap::new();
        for (index, payload) in updates {
            let key = self.leaf_key(*index);
            self.store.put_value(key, payload)?;
            dirty.insert(*index, payload.leaf_hash());
        }
        if dirty.is_empty() {
            return self.root();
        }

        let mut depth = TREE_DEPTH;
        loop {
            for (path, hash) in &dirty {
                self.put_node(MerklePath { path: *path, depth }, *hash);
            }
            if depth == 0 {
                break;
            }

            let mut parents: BTreeMap<u32, H256> = BTreeMap::new();
            for path in dirty.keys() {
                let parent = *path >> 1;
                if parents.contains_key(&parent) {
                    continue;
                }
                let left_path = MerklePath { path: parent << 1, depth };
                let right_path = left_path.sibling();
                let left = match dirty.get(&left_path.path) {
                    Some(h) => *h,
                    None => self.node(&left_path)?,
                };
                let right = match dirty.get(&right_path.path) {
                    Some(h) => *h,
                    None => self.node(&right_path)?,
                };
                parents.insert(parent, hash_two(&left, &right));
            }
            dirty = parents;
            depth -= 1;
        }

        self.root()
    }

    fn put_node(&mut self, path: MerklePath, hash: H256) {
        let key = self.node_key(&path);
        if hash == zero_hash(TREE_DEPTH - path.depth) {
            self.store.delete(&key);
        } else {
            self.store.put_raw(key, hash.as_bytes().to_vec());
        }
    }

    fn update_path(&mut self, index: u32, leaf_hash: H256) -> CommanderResult<H256> {
        let mut current = MerklePath::leaf(index, TREE_DEPTH);
        let mut hash = leaf_hash;
        self.put_node(current, hash);

        while !current.is_root() {
            let sibling = self.node(&current.sibling())?;
            hash = if current.is_left() {
                hash_two(&hash, &sibling)
            } else {
                hash_two(&sibling, &hash)
            };
            current = current.parent();
            self.put_node(current, hash);
        }
        Ok(hash)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keccak256;
    use crate::storage::db::CommanderDb;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Blob(u64);

    impl MerkleLeaf for Blob {
        fn leaf_hash(&self) -> H256 {
            keccak256(&self.0.to_be_bytes())
        }
    }

    const SPACES: TreeSpaces = TreeSpaces {
        name: "test",
        leaves: Keyspace::StateLeaf,
        nodes: Keyspace::StateNode,
    };

    #[test]
    fn empty_tree_root_is_top_zero_hash() {
        let db = CommanderDb::open_temporary().unwrap();
        let view = db.read();
        let tree: SparseMerkleTree<_, Blob> = SparseMerkleTree::new(&view, SPACES);
        assert_eq!(tree.root().unwrap(), zero_hash(TREE_DEPTH));
    }

    #[test]
    fn missing_leaf_reports_not_found() {
        let db = CommanderDb::open_temporary().unwrap();
        let view = db.read();
        let tree: SparseMerkleTree<_, Blob> = SparseMerkleTree::new(&view, SPACES);
        let err = tree.leaf(3).unwrap_err();
        assert!(matches!(
            err,
            CommanderError::NotFound(crate::error::NotFound::Leaf { index: 3, .. })
        ));
    }

    #[test]
    fn set_leaf_updates_root_and_witness() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        let mut tree = SparseMerkleTree::new(&mut txn, SPACES);

        let root = tree.set_leaf(7, &Blob(70)).unwrap();
        assert_ne!(root, zero_hash(TREE_DEPTH));
        assert_eq!(tree.root().unwrap(), root);
        assert_eq!(tree.leaf(7).unwrap(), Blob(70));

        let w = tree.witness(7).unwrap();
        assert_eq!(w.siblings.len(), 32);
        assert!(w.verify(&root, Blob(70).leaf_hash()));
        // Every sibling of a lone leaf is an empty subtree.
        for (h, s) in w.siblings.iter().enumerate() {
            assert_eq!(*s, zero_hash(h as u8));
        }
    }

    #[test]
    fn clearing_all_leaves_restores_empty_tree() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        let mut tree = SparseMerkleTree::new(&mut txn, SPACES);
        tree.set_leaf(1, &Blob(1)).unwrap();
        tree.set_leaf(u32::MAX, &Blob(2)).unwrap();
        tree.clear_leaf(1).unwrap();
        let root = tree.clear_leaf(u32::MAX).unwrap();
        assert_eq!(root, zero_hash(TREE_DEPTH));
        drop(tree);
        // No stray node records left behind.
        assert_eq!(txn.scan_raw(&Keyspace::StateNode.prefix()).count(), 0);
    }

    #[test]
    fn leaves_iterates_in_index_order_and_restarts() {
        let db = CommanderDb::open_temporary().unwrap();
        let mut txn = db.begin();
        let mut tree = SparseMerkleTree::new(&mut txn, SPACES);
        for i in [9u32, 2, 300] {
            tree.set_leaf(i, &Blob(i as u64)).unwrap();
        }
        let first: Vec<u32> = tree.leaves().map(|r| r.unwrap().0).collect();
        let second: Vec<u32> = tree.leaves().map(|r| r.unwrap().0).collect();
        assert_eq!(first, vec![2, 9, 300]);
        assert_eq!(first, second);
    }

    #[test]
    fn batched_updates_match_sequential_updates() {
        let updates: Vec<(u32, Blob)> =
            vec![(0, Blob(1)), (1, Blob(2)), (1 << 20, Blob(3)), (0, Blob(4))];

        let db = CommanderDb::open_temporary().unwrap();
        let mut a = db.begin();
        let seq_root = {
            let mut tree = SparseMerkleTree::new(&mut a, SPACES);
            let mut root = H256::zero();
            for (i, leaf) in &updates {
                root = tree.set_leaf(*i, leaf).unwrap();
            }
            root
        };
        drop(a);

        let mut b = db.begin();
        let mut tree = SparseMerkleTree::new(&mut b, SPACES);
        let batch_root = tree.set_leaves(&updates).unwrap();
        assert_eq!(seq_root, batch_root);
        assert_eq!(tree.leaf(0).unwrap(), Blob(4));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn every_witness_verifies_after_arbitrary_updates(
            ops in prop::collection::vec((0u32..64, any::<u64>()), 1..24)
        ) {
            let db = CommanderDb::open_temporary().unwrap();
            let mut txn = db.begin();
            let mut tree = SparseMerkleTree::new(&mut txn, SPACES);
            for (i, v) in &ops {
                tree.set_leaf(*i, &Blob(*v)).unwrap();
            }
            let root = tree.root().unwrap();
            for (i, _) in &ops {
                let leaf = tree.leaf(*i).unwrap();
                prop_assert!(tree.witness(*i).unwrap().verify(&root, leaf.leaf_hash()));
            }
        }

        #[test]
        fn root_is_independent_of_application_order(
            entries in prop::collection::btree_map(0u32..1024, any::<u64>(), 1..16),
            seed in any::<u64>()
        ) {
            let forward: Vec<(u32, u64)> = entries.into_iter().collect();
            let mut shuffled = forward.clone();
            // Deterministic shuffle driven by the seed.
            let n = shuffled.len();
            for i in 0..n {
                let j = ((seed.wrapping_mul(6364136223846793005).wrapping_add(i as u64)) % n as u64) as usize;
                shuffled.swap(i, j);
            }

            let db = CommanderDb::open_temporary().unwrap();
            let r1 = {
                let mut txn = db.begin();
                let mut tree = SparseMerkleTree::new(&mut txn, SPACES);
                for (i, v) in &forward {
                    tree.set_leaf(*i, &Blob(*v)).unwrap();
                }
                tree.root().unwrap()
            };
            let r2 = {
                let mut txn = db.begin();
                let mut tree = SparseMerkleTree::new(&mut txn, SPACES);
                for (i, v) in &shuffled {
                    tree.set_leaf(*i, &Blob(*v)).unwrap();
                }
                tree.root().unwrap()
            };
            prop_assert_eq!(r1, r2);
        }
    }
}
