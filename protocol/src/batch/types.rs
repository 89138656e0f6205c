//! Commitment and batch records.

use std::fmt;

use chrono::{DateTime, Utc};
use primitive_types::{H256, U256};
use serde::{Deserialize, Serialize};

use crate::crypto::hash::{u256_word, u32_word};
use crate::crypto::{keccak256_multi, Signature};
use crate::transaction::{Transaction, TxType};

/// `(batchID, indexInBatch)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentId {
    pub batch_id: u64,
    pub index: u32,
}

impl fmt::Display for CommitmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.batch_id, self.index)
    }
}

/// Extra data carried by mass-migration commitments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MassMigrationMeta {
    pub spoke_id: u32,
    pub token_id: U256,
    pub total_amount: U256,
    pub withdraw_root: H256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commitment {
    pub id: CommitmentId,
    pub commitment_type: TxType,
    pub post_state_root: H256,
    pub fee_receiver_state_id: u32,
    pub combined_signature: Signature,
    pub body_hash: H256,
    /// Compact calldata of `transactions`, as submitted.
    pub calldata: Vec<u8>,
    pub transactions: Vec<Transaction>,
    pub mass_migration: Option<MassMigrationMeta>,
}

impl Commitment {
    /// Hash of the commitment body as the rollup contract computes it.
    /// `account_root` is the batch's account tree snapshot.
    pub fn compute_body_hash(&self, account_root: &H256) -> H256 {
        let fee_receiver = u32_word(self.fee_receiver_state_id);
        match &self.mass_migration {
            None => keccak256_multi(&[
                account_root.as_bytes(),
                self.combined_signature.as_bytes(),
                &fee_receiver,
                &self.calldata,
            ]),
            Some(meta) => keccak256_multi(&[
                account_root.as_bytes(),
                self.combined_signature.as_bytes(),
                &u32_word(meta.spoke_id),
                meta.withdraw_root.as_bytes(),
                &u256_word(&meta.token_id),
                &u256_word(&meta.total_amount),
                &fee_receiver,
                &self.calldata,
            ]),
        }
    }

    /// Leaf of the batch's commitment tree.
    pub fn leaf_hash(&self) -> H256 {
        keccak256_multi(&[self.post_state_root.as_bytes(), self.body_hash.as_bytes()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchStatus {
    Pending,
    Submitted,
    Mined,
    Finalised,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Mined => write!(f, "MINED"),
            Self::Finalised => write!(f, "FINALISED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: u64,
    pub batch_type: TxType,
    pub status: BatchStatus,
    /// Base-chain transaction that carried the batch.
    pub transaction_hash: Option<H256>,
    /// Root of the commitment tree.
    pub hash: H256,
    pub finalisation_block: Option<u64>,
    pub account_tree_root: H256,
    /// State root before the first commitment was applied.
    pub prev_state_root: H256,
    pub submission_time: Option<DateTime<Utc>>,
    pub commitments: Vec<Commitment>,
}

impl Batch {
    pub fn commitment(&self, index: u32) -> Option<&Commitment> {
        self.commitments.get(index as usize)
    }

    pub fn post_state_root(&self) -> H256 {
        self.commitments
            .last()
            .map(|c| c.post_state_root)
            .unwrap_or(self.prev_state_root)
    }

    pub fn transaction_count(&self) -> usize {
        self.commitments.iter().map(|c| c.transactions.len()).sum()
    }
}

/// Where an included transaction ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub commitment_id: CommitmentId,
    /// Mempool arrival number, restored if the batch is reverted.
    pub arrival_seq: u64,
}

/// A transaction dropped while being applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTx {
    pub tx: Transaction,
    pub error: String,
}
