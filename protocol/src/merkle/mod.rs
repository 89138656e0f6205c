//! # Merkle Trees
//!
//! Two flavours, one hashing convention:
//!
//! - [`sparse::SparseMerkleTree`] — fixed depth 32, persisted node by node
//!   in the key-value store. The state and account trees are built on it.
//! - [`memory::CommitmentMerkleTree`] — small, in-memory, rebuilt on demand
//!   from a list of leaf hashes. Batch hashes, commitment inclusion proofs
//!   and withdraw trees use it.
//!
//! A parent is `keccak(left ‖ right)`. Empty subtrees hash to the
//! precomputed [`zero_hash`] of their height, so computing a root never
//! visits a leaf that was not set.
//!
//! ## Witness order
//!
//! A [`Witness`] lists sibling hashes from the leaf upwards, one per level.
//! Bit `i` of `path.path` says whether the node at height `i` is a right
//! child. The base-chain verifier replays exactly this order, so it must
//! never be reversed or reshuffled.

pub mod memory;
pub mod sparse;

use std::sync::OnceLock;

use primitive_types::H256;
use serde::{Deserialize, Serialize};

use crate::crypto::{hash_two, keccak256};

pub use memory::CommitmentMerkleTree;
pub use sparse::{MerkleLeaf, SparseMerkleTree, TreeSpaces};

/// Depth of the state and account trees.
pub const TREE_DEPTH: u8 = 32;

/// Hash of an empty subtree of the given height (0 = a single empty leaf).
///
/// # Panics
///
/// Never for `height <= 32`; callers only pass heights derived from a tree
/// depth, which is at most [`TREE_DEPTH`].
pub fn zero_hash(height: u8) -> H256 {
    static ZERO_HASHES: OnceLock<Vec<H256>> = OnceLock::new();
    let table = ZERO_HASHES.get_or_init(|| {
        let mut table = Vec::with_capacity(TREE_DEPTH as usize + 1);
        table.push(keccak256(&[0u8; 32]));
        for h in 1..=TREE_DEPTH as usize {
            let below = table[h - 1];
            table.push(hash_two(&below, &below));
        }
        table
    });
    table[usize::from(height.min(TREE_DEPTH))]
}

// ---------------------------------------------------------------------------
// MerklePath
// ---------------------------------------------------------------------------

/// Position of a node: `depth` edges below the root, `path` counted from
/// the left at that depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MerklePath {
    pub path: u32,
    pub depth: u8,
}

impl MerklePath {
    pub const ROOT: MerklePath = MerklePath { path: 0, depth: 0 };

    pub fn leaf(index: u32, depth: u8) -> Self {
        Self { path: index, depth }
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    pub fn is_left(&self) -> bool {
        self.path & 1 == 0
    }

    pub fn sibling(&self) -> Self {
        Self {
            path: self.path ^ 1,
            depth: self.depth,
        }
    }

    /// Parent node. Calling this on the root returns the root.
    pub fn parent(&self) -> Self {
        if self.is_root() {
            return *self;
        }
        Self {
            path: self.path >> 1,
            depth: self.depth - 1,
        }
    }

    /// Storage key suffix: depth byte followed by the big-endian path.
    pub fn key_bytes(&self) -> [u8; 5] {
        let mut out = [0u8; 5];
        out[0] = self.depth;
        out[1..].copy_from_slice(&self.path.to_be_bytes());
        out
    }
}

// ---------------------------------------------------------------------------
// Witness
// ---------------------------------------------------------------------------

/// Inclusion proof for one leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub path: MerklePath,
    /// Sibling hashes, leaf-to-root.
    pub siblings: Vec<H256>,
}

impl Witness {
    /// Fold `leaf_hash` up the tree using the recorded siblings.
    pub fn compute_root(&self, leaf_hash: H256) -> H256 {
        let mut current = leaf_hash;
        for (height, sibling) in self.siblings.iter().enumerate() {
            let is_right = height < 32 && (self.path.path >> height) & 1 == 1;
            current = if is_right {
                hash_two(sibling, &current)
            } else {
                hash_two(&current, sibling)
            };
        }
        current
    }

    /// Whether this witness proves `leaf_hash` under `root`.
    pub fn verify(&self, root: &H256, leaf_hash: H256) -> bool {
        self.siblings.len() == usize::from(self.path.depth) && self.compute_root(leaf_hash) == *root
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
