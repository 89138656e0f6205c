//! Inclusion proofs served to clients and the withdraw manager.
//!
//! A commitment proof shows that a commitment is a leaf of its batch's
//! commitment tree. A withdraw proof shows that one mass-migration
//! transaction is a leaf of its commitment's withdraw tree, which the spoke
//! checks before paying out.

use primitive_types::{H256, U256};
use serde::{Deserialize, Serialize};

use super::types::{Batch, Commitment, CommitmentId, MassMigrationMeta};
use crate::crypto::Signature;
use crate::error::{CommanderError, CommanderResult, NotFound};
use crate::merkle::{CommitmentMerkleTree, MerkleLeaf, MerklePath};
use crate::storage::db::KvRead;
use crate::storage::state_tree::{StateTree, UserState};
use crate::transaction::{Transaction, TxType};

/// Withdraw tree leaves: one per transaction, owned by the sender's pubkey
/// and holding the migrated amount with a zero nonce.
pub fn withdraw_leaves<S: KvRead>(
    store: &S,
    txs: &[Transaction],
    token_id: U256,
) -> CommanderResult<Vec<UserState>> {
    let states = StateTree::new(store);
    txs.iter()
        .map(|tx| {
            let sender = states.leaf(tx.from_state_id())?;
            Ok(UserState {
                pub_key_id: sender.pub_key_id,
                token_id,
                balance: tx.base().amount,
                nonce: U256::zero(),
            })
        })
        .collect()
}

pub fn withdraw_tree(leaves: &[UserState]) -> CommitmentMerkleTree {
    let hashes: Vec<H256> = leaves.iter().map(MerkleLeaf::leaf_hash).collect();
    CommitmentMerkleTree::new(&hashes)
}

/// Commitment body fields, enough to recompute the body hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentBody {
    pub account_root: H256,
    pub signature: Signature,
    #[serde(rename = "feeReceiver")]
    pub fee_receiver: u32,
    /// Hex of the commitment calldata.
    pub transactions: String,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub mass_migration: Option<MassMigrationMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentProof {
    pub state_root: H256,
    pub body: CommitmentBody,
    pub path: MerklePath,
    pub witness: Vec<H256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawProof {
    pub user_state: UserState,
    pub path: MerklePath,
    pub witness: Vec<H256>,
    pub root: H256,
}

fn commitment_of(batch: &Batch, id: CommitmentId) -> CommanderResult<&Commitment> {
    batch
        .commitment(id.index)
        .ok_or_else(|| NotFound::Commitment(id).into())
}

/// Proof that commitment `id` belongs to its batch.
pub fn commitment_proof(batch: &Batch, id: CommitmentId) -> CommanderResult<CommitmentProof> {
    let commitment = commitment_of(batch, id)?;
    let leaves: Vec<H256> = batch.commitments.iter().map(Commitment::leaf_hash).collect();
    let tree = CommitmentMerkleTree::new(&leaves);
    let witness = tree
        .witness(id.index as usize)
        .ok_or_else(|| NotFound::Commitment(id))?;

    Ok(CommitmentProof {
        state_root: commitment.post_state_root,
        body: CommitmentBody {
            account_root: batch.account_tree_root,
            signature: commitment.combined_signature,
            fee_receiver: commitment.fee_receiver_state_id,
            transactions: format!("0x{}", hex::encode(&commitment.calldata)),
            mass_migration: commitment.mass_migration.clone(),
        },
        path: witness.path,
        witness: witness.siblings,
    })
}

/// Proof that mass migration `tx_hash` is a leaf of the withdraw tree of
/// commitment `id`.
pub fn withdraw_proof<S: KvRead>(
    store: &S,
    batch: &Batch,
    id: CommitmentId,
    tx_hash: &H256,
) -> CommanderResult<WithdrawProof> {
    if batch.batch_type != TxType::MassMigration {
        return Err(CommanderError::NotMassMigrationBatch(batch.id));
    }
    let commitment = commitment_of(batch, id)?;
    let meta = commitment.mass_migration.as_ref().ok_or_else(|| {
        CommanderError::WithdrawProofUnavailable(format!("commitment {id} has no withdraw tree"))
    })?;
    let position = commitment
        .transactions
        .iter()
        .position(|tx| tx.hash() == *tx_hash)
        .ok_or(CommanderError::MassMigrationNotInCommitment(*tx_hash))?;

    let leaves = withdraw_leaves(store, &commitment.transactions, meta.token_id)?;
    let tree = withdraw_tree(&leaves);
    if tree.root() != meta.withdraw_root {
        return Err(CommanderError::WithdrawProofUnavailable(format!(
            "withdraw root of commitment {id} no longer matches state"
        )));
    }
    let witness = tree.witness(position).ok_or_else(|| {
        CommanderError::Internal(format!("no withdraw witness at position {position}"))
    })?;

    Ok(WithdrawProof {
        user_state: leaves[position].clone(),
        path: witness.path,
        witness: witness.siblings,
        root: meta.withdraw_root,
    })
}
