//! Batch submitter used when no base-chain client is configured.

use async_trait::async_trait;
use primitive_types::H256;

use rollup_protocol::batch::{Batch, BatchSubmitter};
use rollup_protocol::crypto::keccak256_multi;

/// Logs every batch instead of sending it and reports a deterministic
/// placeholder transaction hash, `keccak(batchHash ‖ batchID)`.
#[derive(Debug, Default)]
pub struct LoggingSubmitter;

#[async_trait]
impl BatchSubmitter for LoggingSubmitter {
    async fn submit(&self, batch: &Batch) -> anyhow::Result<H256> {
        let tx_hash = keccak256_multi(&[batch.hash.as_bytes(), &batch.id.to_be_bytes()]);
        tracing::info!(
            batch_id = batch.id,
            batch_type = ?batch.batch_type,
            commitments = batch.commitments.len(),
            batch_hash = ?batch.hash,
            tx_hash = ?tx_hash,
            "batch ready for the base chain"
        );
        Ok(tx_hash)
    }
}
