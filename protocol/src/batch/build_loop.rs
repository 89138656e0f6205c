//! # Batch Build Loop
//!
//! Background task that turns the mempool into batches and hands them to
//! the base chain.
//!
//! Each cycle:
//!
//! 1. Skip everything while the commander is in migration mode.
//! 2. Build at most one batch per transaction type
//!    ([`Commander::build_batches`]); each batch is committed before it is
//!    submitted.
//! 3. Submit every new batch through the [`BatchSubmitter`] and record the
//!    returned base-chain transaction hash. A failed submission leaves the
//!    batch pending; it is logged and the loop carries on.
//! 4. Sleep for the configured interval.
//!
//! ## Shutdown
//!
//! The loop watches a `tokio::sync::watch` channel and exits when it reads
//! `true` or the sender goes away. A cycle in progress runs to completion
//! first, so no batch is left half-built.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use primitive_types::H256;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::types::Batch;
use crate::commander::Commander;
use crate::error::CommanderResult;

/// The base-chain side of batch submission.
#[async_trait]
pub trait BatchSubmitter: Send + Sync {
    /// Send `batch` to the rollup contract and return the hash of the
    /// carrying transaction.
    async fn submit(&self, batch: &Batch) -> anyhow::Result<H256>;
}

pub struct BuildLoop {
    commander: Commander,
    submitter: Arc<dyn BatchSubmitter>,
    interval: Duration,
}

impl BuildLoop {
    pub fn new(commander: Commander, submitter: Arc<dyn BatchSubmitter>) -> Self {
        let interval = commander.config().rollup.batch_loop_interval();
        Self {
            commander,
            submitter,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run cycles until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "batch build loop starting");

        loop {
            if *shutdown.borrow() {
                info!("batch build loop received shutdown signal, exiting");
                return;
            }

            if self.commander.is_migrating() {
                debug!("migration mode, skipping build cycle");
            } else {
                match self.run_single_cycle().await {
                    Ok(batches) if batches.is_empty() => debug!("no batch built this cycle"),
                    Ok(batches) => debug!(batches = batches.len(), "build cycle finished"),
                    Err(err) => error!(error = %err, "build cycle failed"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("shutdown sender dropped, stopping batch build loop");
                        return;
                    }
                }
            }
        }
    }

    /// Build and submit once. Returns the batches built, whether or not
    /// their submission went through.
    pub async fn run_single_cycle(&self) -> CommanderResult<Vec<Batch>> {
        let batches = self.commander.build_batches(Utc::now())?;
        for batch in &batches {
            match self.submitter.submit(batch).await {
                Ok(tx_hash) => {
                    self.commander.mark_batch_submitted(batch.id, tx_hash)?;
                }
                Err(err) => {
                    warn!(batch_id = batch.id, error = %err, "batch submission failed");
                }
            }
        }
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchStatus;
    use crate::config::{CommanderConfig, GenesisAccount, RollupConfig};
    use crate::crypto::BlsKeypair;
    use crate::storage::CommanderDb;
    use crate::transaction::{TransactionBuilder, TransactionRequest};
    use parking_lot::Mutex;
    use primitive_types::U256;

    #[derive(Default)]
    struct Recorder {
        submitted: Mutex<Vec<u64>>,
        fail: bool,
    }

    #[async_trait]
    impl BatchSubmitter for Recorder {
        async fn submit(&self, batch: &Batch) -> anyhow::Result<H256> {
            if self.fail {
                anyhow::bail!("base chain unavailable");
            }
            self.submitted.lock().push(batch.id);
            Ok(H256::from_low_u64_be(batch.id))
        }
    }

    fn commander() -> Commander {
        let genesis = (0..2u8)
            .map(|i| GenesisAccount {
                public_key: BlsKeypair::from_seed(&[i + 1; 32]).unwrap().public_key(),
                token_id: U256::zero(),
                balance: 420.into(),
            })
            .collect();
        let config = CommanderConfig {
            rollup: RollupConfig {
                disable_signatures: true,
                batch_loop_interval_ms: 10,
                ..RollupConfig::default()
            },
            genesis,
            ..CommanderConfig::default()
        };
        Commander::open(CommanderDb::open_temporary().unwrap(), config).unwrap()
    }

    fn send_one(commander: &Commander) {
        let tx = TransactionBuilder::transfer(1, 0).amount(5).build();
        commander
            .send_transaction(TransactionRequest::from(&tx))
            .unwrap();
    }

    #[tokio::test]
    async fn cycle_builds_and_marks_submitted() {
        let commander = commander();
        send_one(&commander);
        let recorder = Arc::new(Recorder::default());
        let build_loop = BuildLoop::new(commander.clone(), recorder.clone());

        let batches = build_loop.run_single_cycle().await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(*recorder.submitted.lock(), vec![batches[0].id]);

        let stored = commander.get_batch(batches[0].id).unwrap();
        assert_eq!(stored.status, BatchStatus::Submitted);
        assert_eq!(stored.transaction_hash, Some(H256::from_low_u64_be(stored.id)));
    }

    #[tokio::test]
    async fn failed_submission_leaves_batch_pending() {
        let commander = commander();
        send_one(&commander);
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let build_loop = BuildLoop::new(commander.clone(), recorder);

        let batches = build_loop.run_single_cycle().await.unwrap();
        assert_eq!(commander.get_batch(batches[0].id).unwrap().status, BatchStatus::Pending);
    }

    #[tokio::test]
    async fn empty_mempool_builds_nothing() {
        let build_loop = BuildLoop::new(commander(), Arc::new(Recorder::default()));
        assert!(build_loop.run_single_cycle().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_signal_stops_loop() {
        let commander = commander();
        send_one(&commander);
        let build_loop = BuildLoop::new(commander.clone(), Arc::new(Recorder::default()));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { build_loop.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap();

        assert_eq!(commander.mempool_size().unwrap(), 0);
    }
}
