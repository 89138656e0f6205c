//! In-memory Merkle tree over a short list of leaf hashes.

use primitive_types::H256;

use super::{zero_hash, MerklePath, Witness};
use crate::crypto::hash_two;

/// Complete binary tree whose leaf count is padded up to the next power of
/// two with `zero_hash(0)`. Used for batch hashes (over commitment leaves),
/// commitment inclusion proofs, and mass-migration withdraw roots.
///
/// A single leaf is its own root and has an empty witness.
#[derive(Debug, Clone)]
pub struct CommitmentMerkleTree {
    /// `levels[0]` are the padded leaves, the last level holds the root.
    levels: Vec<Vec<H256>>,
}

impl CommitmentMerkleTree {
    /// Build from leaf hashes. An empty input yields a tree whose root is
    /// `zero_hash(0)`.
    pub fn new(leaves: &[H256]) -> Self {
        let depth = depth_for(leaves.len());
        let width = 1usize << depth;

        let mut level: Vec<H256> = leaves.to_vec();
        level.resize(width, zero_hash(0));

        let mut levels = vec![level];
        while levels.last().map_or(0, Vec::len) > 1 {
            let below = &levels[levels.len() - 1];
            let above = below
                .chunks(2)
                .map(|pair| hash_two(&pair[0], &pair[1]))
                .collect();
            levels.push(above);
        }
        Self { levels }
    }

    /// Number of edges between the root and a leaf.
    pub fn depth(&self) -> u8 {
        (self.levels.len() - 1) as u8
    }

    pub fn root(&self) -> H256 {
        self.levels
            .last()
            .and_then(|top| top.first())
            .copied()
            .unwrap_or_else(|| zero_hash(0))
    }

    /// Witness for leaf `index`, or `None` when the index is past the padded
    /// width.
    pub fn witness(&self, index: usize) -> Option<Witness> {
        if index >= self.levels[0].len() {
            return None;
        }
        let mut siblings = Vec::with_capacity(self.levels.len() - 1);
        let mut position = index;
        for level in &self.levels[..self.levels.len() - 1] {
            siblings.push(level[position ^ 1]);
            position >>= 1;
        }
        Some(Witness {
            path: MerklePath::leaf(index as u32, self.depth()),
            siblings,
        })
    }
}

/// `ceil(log2(n))`, with 0 and 1 both mapping to a zero-depth tree.
fn depth_for(n: usize) -> u8 {
    if n <= 1 {
        0
    } else {
        (usize::BITS - (n - 1).leading_zeros()) as u8
    }
}
